//! Detection of blocked or interstitial responses before extraction.

use crate::fetch::FetchError;

const BLOCKING_INDICATORS: &[&str] = &[
    "access denied",
    "captcha",
    "bot detection",
    "rate limit",
    "too many requests",
    "403 forbidden",
    "you are being rate limited",
    "your request has been blocked",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageHealth {
    Healthy,
    Blocked { indicator: String },
    TooShort { len: usize },
}

impl PageHealth {
    /// Convert an unhealthy verdict into the fetch failure it represents.
    pub fn into_result(self, url: &str) -> Result<(), FetchError> {
        match self {
            PageHealth::Healthy => Ok(()),
            PageHealth::Blocked { indicator } => Err(FetchError::Blocked {
                indicator,
                url: url.to_string(),
            }),
            PageHealth::TooShort { len } => Err(FetchError::TooShort {
                len,
                url: url.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct HealthDetector {
    min_body_bytes: usize,
}

impl Default for HealthDetector {
    fn default() -> Self {
        Self::new(1000)
    }
}

impl HealthDetector {
    pub fn new(min_body_bytes: usize) -> Self {
        Self { min_body_bytes }
    }

    pub fn check(&self, body: &str) -> PageHealth {
        if body.len() < self.min_body_bytes {
            return PageHealth::TooShort { len: body.len() };
        }

        let lower = body.to_lowercase();
        if let Some(indicator) = BLOCKING_INDICATORS.iter().find(|i| lower.contains(*i)) {
            return PageHealth::Blocked {
                indicator: (*indicator).to_string(),
            };
        }
        if mentions_robot_outside_metadata(&lower) {
            return PageHealth::Blocked {
                indicator: "robot".to_string(),
            };
        }
        PageHealth::Healthy
    }
}

/// "robot" counts only outside `<meta>` tags and `robots.txt` references.
fn mentions_robot_outside_metadata(lower: &str) -> bool {
    let mut rest = lower;
    let mut visible = String::with_capacity(lower.len());
    while let Some(start) = rest.find("<meta") {
        visible.push_str(&rest[..start]);
        match rest[start..].find('>') {
            Some(end) => rest = &rest[start + end + 1..],
            None => {
                rest = "";
                break;
            }
        }
    }
    visible.push_str(rest);
    visible.replace("robots.txt", "").contains("robot")
}
