use std::time::Duration;

/// Runtime knobs for a [`MessageStore`](crate::MessageStore) session.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Base URL of the messaging API, e.g. `http://localhost:5001/api/messages`.
    pub api_url: String,
    pub request_timeout: Duration,
    /// Typing indicators older than this are cleared.
    pub typing_timeout: Duration,
    /// How often stale typing indicators are swept.
    pub typing_tick: Duration,
    /// Synthetic counterpart replies; `None` disables them.
    pub replies: Option<ReplySimulation>,
}

/// A canned answer from the other participant, delivered a random delay
/// after each send with the given probability.
#[derive(Debug, Clone)]
pub struct ReplySimulation {
    pub probability: f64,
    pub min_delay: Duration,
    pub max_delay: Duration,
}

impl ReplySimulation {
    /// Probability usable as a Bernoulli parameter. Anything that is not a
    /// finite number means no replies.
    pub fn chance(&self) -> f64 {
        if self.probability.is_finite() {
            self.probability.clamp(0.0, 1.0)
        } else {
            0.0
        }
    }
}

impl Default for ReplySimulation {
    fn default() -> Self {
        Self {
            probability: 0.3,
            min_delay: Duration::from_secs(3),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            api_url: "http://localhost:5001/api/messages".into(),
            request_timeout: Duration::from_secs(10),
            typing_timeout: Duration::from_millis(5000),
            typing_tick: Duration::from_secs(1),
            replies: None,
        }
    }
}

impl StoreConfig {
    /// Reads `WORKIT_*` variables, falling back to defaults for anything
    /// unset or unparsable.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let api_url = std::env::var("WORKIT_API_URL").unwrap_or(defaults.api_url);
        let request_timeout = env_parse::<u64>("WORKIT_REQUEST_TIMEOUT_SECS")
            .map(Duration::from_secs)
            .unwrap_or(defaults.request_timeout);
        let typing_timeout = env_parse::<u64>("WORKIT_TYPING_TIMEOUT_MS")
            .map(Duration::from_millis)
            .unwrap_or(defaults.typing_timeout);

        let replies = env_parse::<bool>("WORKIT_SIMULATE_REPLIES")
            .unwrap_or(false)
            .then(|| {
                let mut sim = ReplySimulation::default();
                if let Some(p) = std::env::var("WORKIT_REPLY_PROBABILITY")
                    .ok()
                    .and_then(|raw| parse_probability(&raw))
                {
                    sim.probability = p;
                }
                sim
            });

        Self {
            api_url,
            request_timeout,
            typing_timeout,
            typing_tick: defaults.typing_tick,
            replies,
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

/// Accepts finite values only; `NaN` and infinities parse as `f64` but are
/// rejected here.
fn parse_probability(raw: &str) -> Option<f64> {
    raw.trim()
        .parse::<f64>()
        .ok()
        .filter(|p| p.is_finite())
        .map(|p| p.clamp(0.0, 1.0))
}
