use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use super::LoadTestError;

/// Longest load test accepted from a request.
pub const MAX_DURATION: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadGeneratorKind {
    #[default]
    Fortio,
    Wrk2,
}

impl LoadGeneratorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fortio => "fortio",
            Self::Wrk2 => "wrk2",
        }
    }
}

impl fmt::Display for LoadGeneratorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LoadGeneratorKind {
    type Err = LoadTestError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "" | "fortio" => Ok(Self::Fortio),
            "wrk2" => Ok(Self::Wrk2),
            other => Err(LoadTestError::option(
                "loadGenerator",
                format!("unsupported load generator `{other}`"),
            )),
        }
    }
}

/// Validated parameters of one load test.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadTestOptions {
    pub name: String,
    pub mesh: Option<String>,
    pub test_uuid: Option<String>,
    pub url: Url,
    pub duration: Duration,
    pub concurrency: usize,
    /// Target requests per second across all workers; zero means unpaced.
    pub qps: f64,
    pub generator: LoadGeneratorKind,
}

impl LoadTestOptions {
    /// Parses the query string of a load-test request.
    ///
    /// `t` is a count of `dur` units (`h`, `m`, anything else is seconds).
    pub fn from_query(params: &HashMap<String, String>) -> Result<Self, LoadTestError> {
        let get = |key: &str| param(params, key);

        let name = get("name")
            .ok_or_else(|| LoadTestError::option("name", "a test name is required"))?
            .to_string();

        let count = match get("t") {
            Some(raw) => raw
                .parse::<u64>()
                .ok()
                .filter(|count| *count >= 1)
                .ok_or_else(|| {
                    LoadTestError::option("t", "test duration must be a positive whole number")
                })?,
            None => return Err(LoadTestError::option("t", "test duration is required")),
        };
        let unit_secs: u64 = match get("dur").map(|unit| unit.to_ascii_lowercase()) {
            Some(unit) if unit == "h" => 60 * 60,
            Some(unit) if unit == "m" => 60,
            _ => 1,
        };
        let duration = count
            .checked_mul(unit_secs)
            .map(Duration::from_secs)
            .filter(|duration| *duration <= MAX_DURATION)
            .ok_or_else(|| LoadTestError::option("t", "test duration must not exceed 24 hours"))?;

        let concurrency = match get("c") {
            Some(raw) => raw
                .parse::<usize>()
                .ok()
                .filter(|threads| *threads >= 1)
                .ok_or_else(|| LoadTestError::option("c", "thread count must be at least 1"))?,
            None => 1,
        };

        let qps = match get("qps") {
            Some(raw) => raw
                .parse::<f64>()
                .ok()
                .filter(|qps| qps.is_finite() && *qps >= 0.0)
                .ok_or_else(|| LoadTestError::option("qps", "qps must be zero or more"))?,
            None => 0.0,
        };

        let raw_url =
            get("url").ok_or_else(|| LoadTestError::option("url", "a target url is required"))?;
        let url = Url::parse(raw_url)
            .map_err(|err| LoadTestError::option("url", err.to_string()))?;
        if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
            return Err(LoadTestError::option(
                "url",
                "target must be an absolute http(s) url",
            ));
        }

        let generator = match get("loadGenerator") {
            Some(raw) => raw.parse()?,
            None => LoadGeneratorKind::default(),
        };

        Ok(Self {
            name,
            mesh: get("mesh").map(str::to_string),
            test_uuid: get("uuid").map(str::to_string),
            url,
            duration,
            concurrency,
            qps,
            generator,
        })
    }
}

fn param<'a>(params: &'a HashMap<String, String>, key: &str) -> Option<&'a str> {
    params
        .get(key)
        .map(|value| value.trim())
        .filter(|value| !value.is_empty())
}
