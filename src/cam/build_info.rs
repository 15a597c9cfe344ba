pub fn build_host() -> &'static str {
    option_env!("CAMMASTER_BUILD_HOST").unwrap_or("unknown")
}

pub fn build_time_raw() -> &'static str {
    option_env!("CAMMASTER_BUILD_TIME").unwrap_or("unknown")
}

pub fn build_time_pretty() -> String {
    format_build_time_pretty(build_time_raw())
}

/// `build.rs` emits `epoch:<unix seconds>`; anything else (a hand-set value,
/// or "unknown" when the env var is absent) passes through untouched.
pub fn format_build_time_pretty(raw: &str) -> String {
    let raw = raw.trim();
    let Some(epoch) = raw.strip_prefix("epoch:") else {
        return raw.to_string();
    };
    match epoch
        .trim()
        .parse::<i64>()
        .ok()
        .and_then(|secs| chrono::DateTime::<chrono::Utc>::from_timestamp(secs, 0))
    {
        Some(dt) => dt.format("%Y-%m-%d %H:%M:%S").to_string(),
        None => raw.to_string(),
    }
}

pub fn banner() -> String {
    format!(
        "cammaster {} (built {} UTC on {})",
        env!("CARGO_PKG_VERSION"),
        build_time_pretty(),
        build_host()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn epoch_stamps_render_as_utc() {
        assert_eq!(format_build_time_pretty("epoch:0"), "1970-01-01 00:00:00");
        assert_eq!(
            format_build_time_pretty("epoch:1788000000"),
            "2026-08-29 10:40:00"
        );
    }

    #[test]
    fn non_epoch_values_pass_through() {
        assert_eq!(format_build_time_pretty("unknown"), "unknown");
        assert_eq!(format_build_time_pretty("epoch:garbage"), "epoch:garbage");
        assert_eq!(format_build_time_pretty("  epoch:0 "), "1970-01-01 00:00:00");
    }

    #[test]
    fn banner_names_the_crate_version() {
        assert!(banner().contains(env!("CARGO_PKG_VERSION")));
    }
}
