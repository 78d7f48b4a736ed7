use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum Interval {
    #[serde(rename = "1m")]
    M1,
    #[serde(rename = "5m")]
    M5,
    #[serde(rename = "15m")]
    M15,
    #[serde(rename = "1h")]
    H1,
    #[serde(rename = "4h")]
    H4,
    #[serde(rename = "1d")]
    #[default]
    D1,
}

impl Interval {
    pub fn as_str(&self) -> &'static str {
        match self {
            Interval::M1 => "1m",
            Interval::M5 => "5m",
            Interval::M15 => "15m",
            Interval::H1 => "1h",
            Interval::H4 => "4h",
            Interval::D1 => "1d",
        }
    }

    pub fn as_duration(&self) -> Duration {
        match self {
            Interval::M1 => Duration::from_secs(60),
            Interval::M5 => Duration::from_secs(300),
            Interval::M15 => Duration::from_secs(900),
            Interval::H1 => Duration::from_secs(3600),
            Interval::H4 => Duration::from_secs(14400),
            Interval::D1 => Duration::from_secs(86400),
        }
    }

    /// Brokerage REST `timeframe` query value.
    pub fn api_timeframe(&self) -> &'static str {
        match self {
            Interval::M1 => "1Min",
            Interval::M5 => "5Min",
            Interval::M15 => "15Min",
            Interval::H1 => "1Hour",
            Interval::H4 => "4Hour",
            Interval::D1 => "1Day",
        }
    }

    pub fn from_str_loose(s: &str) -> Option<Interval> {
        match s.trim().to_lowercase().as_str() {
            "1m" => Some(Interval::M1),
            "5m" => Some(Interval::M5),
            "15m" => Some(Interval::M15),
            "1h" => Some(Interval::H1),
            "4h" => Some(Interval::H4),
            "1d" | "day" | "daily" => Some(Interval::D1),
            _ => None,
        }
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serde_uses_short_names() {
        let json = serde_json::to_string(&Interval::H4).unwrap();
        assert_eq!(json, "\"4h\"");
        let back: Interval = serde_json::from_str("\"1d\"").unwrap();
        assert_eq!(back, Interval::D1);
    }

    #[test]
    fn loose_parse() {
        assert_eq!(Interval::from_str_loose("Daily"), Some(Interval::D1));
        assert_eq!(Interval::from_str_loose("15m"), Some(Interval::M15));
        assert_eq!(Interval::from_str_loose("2w"), None);
    }
}
