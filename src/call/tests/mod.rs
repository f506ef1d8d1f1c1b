use crate::call::{CallState, LineSnapshot, PhoneLine, PhoneLineBuilder};
use crate::event::{EventReceiver, LineEvent};
use crate::media::LoopbackMedia;
use crate::useragent::loopback::{LoopbackOption, LoopbackTransport, Primitive, PrimitiveKind};
use crate::useragent::registration::{RegisterOption, RegistrationStatus, UserCredential};
use crate::useragent::transport::SessionState;
use std::{sync::Arc, time::Duration};
use tokio::time::timeout;

mod outbound_test;

const WAIT: Duration = Duration::from_secs(2);

pub(super) struct TestLine {
    pub phone: PhoneLine,
    pub transport: Arc<LoopbackTransport>,
    pub media: Arc<LoopbackMedia>,
}

impl TestLine {
    pub fn new(option: LoopbackOption) -> Self {
        let transport = Arc::new(LoopbackTransport::new(option));
        let media = Arc::new(LoopbackMedia::new());
        let phone = PhoneLineBuilder::new()
            .with_transport(transport.clone())
            .with_media_engine(media.clone())
            .build()
            .unwrap();
        Self {
            phone,
            transport,
            media,
        }
    }

    pub async fn registered() -> Self {
        Self::registered_with(LoopbackOption::default()).await
    }

    pub async fn registered_with(option: LoopbackOption) -> Self {
        let line = Self::new(option);
        line.phone.connect(register_option()).await.unwrap();
        line
    }

    /// An outbound call to 2000 that the remote side answered.
    pub async fn connected_outbound(option: LoopbackOption) -> Self {
        let line = Self::registered_with(option).await;
        line.phone.dial("2000").await.unwrap();
        assert!(line.transport.emit(SessionState::Established));
        line.wait_for_call(CallState::Connected).await;
        line
    }

    pub fn snapshot(&self) -> LineSnapshot {
        self.phone.snapshot()
    }

    pub async fn wait_for<F>(&self, predicate: F) -> LineSnapshot
    where
        F: FnMut(&LineSnapshot) -> bool,
    {
        let mut watch = self.phone.watch();
        let snapshot = timeout(WAIT, watch.wait_for(predicate))
            .await
            .expect("timed out waiting for line state")
            .expect("line stopped");
        snapshot.clone()
    }

    pub async fn wait_for_call(&self, state: CallState) -> LineSnapshot {
        self.wait_for(|snapshot| snapshot.call_state() == state).await
    }

    pub async fn wait_for_primitive<F>(&self, predicate: F) -> Primitive
    where
        F: Fn(&Primitive) -> bool,
    {
        timeout(WAIT, async {
            loop {
                if let Some(found) = self.transport.journal().into_iter().find(|p| predicate(p)) {
                    return found;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("timed out waiting for primitive")
    }

    pub async fn wait_for_count(&self, kind: PrimitiveKind, expected: usize) {
        timeout(WAIT, async {
            while self.count(kind) < expected {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("timed out waiting for primitive count")
    }

    pub fn session_id(&self) -> String {
        self.transport.last_session().expect("no session")
    }

    pub fn count(&self, kind: PrimitiveKind) -> usize {
        self.transport.count(kind)
    }
}

pub(super) fn register_option() -> RegisterOption {
    RegisterOption {
        server: "ws://pbx.local:8088/ws".to_string(),
        domain: "pbx.local".to_string(),
        username: "1000".to_string(),
        display_name: Some("Desk".to_string()),
        credential: Some(UserCredential {
            username: "1000".to_string(),
            password: "secret".to_string(),
            realm: None,
        }),
        expires: None,
        useragent: None,
    }
}

pub(super) async fn wait_for_event<F>(receiver: &mut EventReceiver, predicate: F) -> LineEvent
where
    F: Fn(&LineEvent) -> bool,
{
    timeout(WAIT, async {
        loop {
            match receiver.recv().await {
                Ok(event) if predicate(&event) => return event,
                Ok(_) => continue,
                Err(e) => panic!("event stream failed: {}", e),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

pub(super) fn is_registered(snapshot: &LineSnapshot) -> bool {
    snapshot.registration == RegistrationStatus::Registered
}
