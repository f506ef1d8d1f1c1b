use chrono::{DateTime, Local};

fn build_date(format: &str) -> String {
    let build_timestamp: i64 = env!("RUSTPHONE_BUILD_TIME").parse().unwrap_or(0);
    let build_datetime: DateTime<Local> = DateTime::from_timestamp(build_timestamp, 0)
        .map(|utc| utc.with_timezone(&Local))
        .unwrap_or_else(Local::now);
    build_datetime.format(format).to_string()
}

pub fn get_version_info() -> String {
    format!(
        "rustphone {}\n\
         Build Time: {}\n\
         Git Commit: {}",
        env!("CARGO_PKG_VERSION"),
        build_date("%Y-%m-%d %H:%M:%S %Z"),
        env!("RUSTPHONE_GIT_COMMIT"),
    )
}

/// Value sent in the SIP User-Agent header when the config does not override it.
pub fn get_useragent() -> String {
    format!(
        "rustphone/{} (build {})",
        env!("CARGO_PKG_VERSION"),
        build_date("%Y-%m-%d")
    )
}
