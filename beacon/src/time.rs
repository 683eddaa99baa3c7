pub trait TimeSource {
    /// Milliseconds since the unix epoch.
    fn now_millis(&self) -> i64;
}

#[derive(Clone)]
pub struct SystemTime {}

impl TimeSource for SystemTime {
    fn now_millis(&self) -> i64 {
        let nanos = time::OffsetDateTime::now_utc().unix_timestamp_nanos();
        i64::try_from(nanos / 1_000_000).unwrap_or(i64::MAX)
    }
}

/// Always returns the same instant, for tests.
#[derive(Clone)]
pub struct FixedTime {
    pub millis: i64,
}

impl TimeSource for FixedTime {
    fn now_millis(&self) -> i64 {
        self.millis
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_time_is_after_2024() {
        // 2024-01-01T00:00:00Z
        assert!(SystemTime {}.now_millis() > 1_704_067_200_000);
    }
}
