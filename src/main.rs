use anyhow::Result;
use clap::Parser;
use rustphone::{
    call::{format_duration, LineSnapshot, PhoneLine, PhoneLineBuilder},
    config::{Cli, Config, LoopbackConfig},
    event::LineEvent,
    useragent::{
        transport::{SessionState, TerminatedReason},
        LoopbackOption, LoopbackTransport, RegisterOption,
    },
    version, PhoneError,
};
use std::{fs::File, sync::Arc};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    select,
    sync::broadcast::error::RecvError,
};
use tracing::{info, level_filters::LevelFilter, warn};

const HELP: &str = "\
commands:
  login | logout
  dial [number]        dial number, or the dial buffer when omitted
  answer | reject | hangup
  hold | unhold | mute | unmute
  transfer <number>
  digit <keys>         keypad input, sent as dtmf while connected
  clear                clear the dial buffer
  status
  incoming <caller> [display name]
  remote <ring|answer|hangup|cancel|busy>
  version | help | quit";

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = cli
        .conf
        .map(|conf| Config::load(&conf).expect("Failed to load config"))
        .unwrap_or_default();

    let mut log_fmt = tracing_subscriber::fmt();
    if let Some(ref level) = config.log_level {
        if let Ok(lv) = level.as_str().parse::<LevelFilter>() {
            log_fmt = log_fmt.with_max_level(lv);
        }
    }

    let _guard = if let Some(ref log_file) = config.log_file {
        let file = File::create(log_file).expect("Failed to create log file");
        let (non_blocking, guard) = tracing_appender::non_blocking(file);
        log_fmt.with_writer(non_blocking).try_init().ok();
        Some(guard)
    } else {
        log_fmt.with_writer(std::io::stderr).try_init().ok();
        None
    };

    let loopback_option = config
        .loopback
        .as_ref()
        .map(LoopbackOption::from)
        .unwrap_or_else(|| LoopbackOption::from(&LoopbackConfig::default()));
    let transport = Arc::new(LoopbackTransport::new(loopback_option));
    let phone = PhoneLineBuilder::new()
        .with_transport(transport.clone())
        .with_config(&config.ua)
        .build()
        .expect("Failed to build phone line");

    info!(
        aor = RegisterOption::from(&config.ua).aor(),
        "Starting {}",
        version::get_useragent()
    );
    tokio::spawn(print_events(phone.clone()));

    if config.ua.auto_connect {
        phone.connect(RegisterOption::from(&config.ua)).await.ok();
    }
    println!("{}", HELP);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received CTRL+C, shutting down");
                break;
            }
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    if !run_command(line.trim(), &phone, &transport, &config).await
                        || phone.is_closed()
                    {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!("stdin closed: {}", e);
                    break;
                }
            }
        }
    }

    phone.disconnect().await.ok();
    phone.shutdown();
    Ok(())
}

/// Returns false once the shell should exit.
async fn run_command(
    line: &str,
    phone: &PhoneLine,
    transport: &LoopbackTransport,
    config: &Config,
) -> bool {
    let mut words = line.split_whitespace();
    let Some(command) = words.next() else {
        return true;
    };
    let rest: Vec<&str> = words.collect();

    // failures are reported through the event stream
    let result = match command {
        "login" => phone.connect(RegisterOption::from(&config.ua)).await,
        "logout" => match phone.disconnect().await {
            Ok(()) => phone.clear_dial_buffer().await,
            Err(e) => Err(e),
        },
        "dial" => match rest.first() {
            Some(number) => phone.dial(number).await,
            None => {
                let number = phone.snapshot().dial_buffer;
                match phone.clear_dial_buffer().await {
                    Ok(()) => phone.dial(&number).await,
                    Err(e) => Err(e),
                }
            }
        },
        "answer" => phone.answer().await,
        "reject" => phone.reject().await,
        "hangup" => phone.hangup().await,
        "hold" => phone.hold().await,
        "unhold" => phone.unhold().await,
        "mute" => phone.mute().await,
        "unmute" => phone.unmute().await,
        "transfer" => match rest.first() {
            Some(number) => phone.transfer(number).await,
            None => {
                println!("usage: transfer <number>");
                Ok(())
            }
        },
        "digit" => {
            let mut result = Ok(());
            for digit in rest.concat().chars() {
                result = phone.send_digit(digit).await;
            }
            result
        }
        "clear" => phone.clear_dial_buffer().await,
        "status" => {
            print_status(&phone.snapshot());
            Ok(())
        }
        "incoming" => {
            match rest.first() {
                Some(caller) => {
                    let display_name = (rest.len() > 1).then(|| rest[1..].join(" "));
                    if let Err(e) = transport.inject_invite(caller, display_name.as_deref()) {
                        println!("! {}", e);
                    }
                }
                None => println!("usage: incoming <caller> [display name]"),
            }
            Ok(())
        }
        "remote" => {
            let state = match rest.first().copied() {
                Some("ring") => Some(SessionState::Provisional(180)),
                Some("answer") => Some(SessionState::Established),
                Some("hangup") => Some(SessionState::Terminated(TerminatedReason::RemoteBye)),
                Some("cancel") => Some(SessionState::Terminated(TerminatedReason::RemoteCancel)),
                Some("busy") => Some(SessionState::Terminated(TerminatedReason::RemoteRejected(486))),
                _ => None,
            };
            match state {
                Some(state) => {
                    if !transport.emit(state) {
                        println!("! no remote session");
                    }
                }
                None => println!("usage: remote <ring|answer|hangup|cancel|busy>"),
            }
            Ok(())
        }
        "version" => {
            println!("{}", version::get_version_info());
            Ok(())
        }
        "help" => {
            println!("{}", HELP);
            Ok(())
        }
        "quit" | "exit" => return false,
        other => {
            println!("unknown command: {} (try help)", other);
            Ok(())
        }
    };
    !matches!(result, Err(PhoneError::LineClosed))
}

fn print_status(snapshot: &LineSnapshot) {
    println!("registration: {}", snapshot.registration);
    match snapshot.call.as_ref() {
        Some(call) => println!(
            "call: {} {} {}{} {}",
            call.state,
            call.direction,
            call.peer_address,
            if call.muted { " (muted)" } else { "" },
            format_duration(call.duration)
        ),
        None => println!("call: idle"),
    }
    if let Some(invitation) = snapshot.invitation.as_ref() {
        println!("incoming: {}", invitation.identity);
    }
    if !snapshot.dial_buffer.is_empty() {
        println!("dial buffer: {}", snapshot.dial_buffer);
    }
    if let Some(error) = snapshot.last_error.as_ref() {
        println!("last error: {}", error);
    }
}

async fn print_events(phone: PhoneLine) {
    let mut events = phone.subscribe();
    loop {
        match events.recv().await {
            Ok(event) => match event {
                LineEvent::Registration { status, .. } => println!("* registration {}", status),
                LineEvent::CallState {
                    state,
                    direction,
                    peer,
                    ..
                } => match (direction, peer) {
                    (Some(direction), Some(peer)) => {
                        println!("* call {} ({} {})", state, direction, peer)
                    }
                    _ => println!("* call {}", state),
                },
                LineEvent::Incoming { caller, .. } => {
                    println!("* incoming call from {}, answer or reject", caller)
                }
                LineEvent::BusyRejected { caller, .. } => {
                    println!("* line busy, refused {}", caller)
                }
                LineEvent::Duration { elapsed, .. } => {
                    if elapsed % 10 == 0 {
                        println!("* {}", format_duration(elapsed));
                    }
                }
                LineEvent::Error { message, .. } => println!("! {}", message),
            },
            Err(RecvError::Lagged(skipped)) => warn!(skipped, "event printer lagged"),
            Err(RecvError::Closed) => break,
        }
    }
}
