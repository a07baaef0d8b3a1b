//! One-shot admin tokens, one outstanding token per client host.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use rand::distributions::{Alphanumeric, DistString};
use sha2::{Digest, Sha256};
use tracing::debug;

use vgx_core::{AdminError, AdminResult, AuthConfig};

/// Rounds used to stretch a brand new seed chain.
const SEED_ROUNDS: usize = 10;

/// A token handed to a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthToken {
    pub token: String,
    pub valid_for: Duration,
}

#[derive(Debug)]
struct Issued {
    token: String,
    /// `None` once consumed.
    expires: Option<Instant>,
}

#[derive(Debug, Default)]
struct TokenState {
    by_host: HashMap<String, Issued>,
    seeds: VecDeque<String>,
}

/// Issues and validates admin tokens.
#[derive(Debug)]
pub struct TokenStore {
    state: Mutex<TokenState>,
    validity: Duration,
    history: usize,
}

impl TokenStore {
    pub fn new(config: &AuthConfig) -> Self {
        Self {
            state: Mutex::new(TokenState::default()),
            validity: config.token_validity(),
            history: config.seed_history.max(1),
        }
    }

    /// Issue a new token for `client_host`, replacing any outstanding one.
    ///
    /// The token is chained from the host's previous token, or from a
    /// fresh random seed for a host seen for the first time.
    pub fn issue(&self, client_host: &str) -> AuthToken {
        let mut state = self.state.lock().expect("token lock");
        let seed = match state.by_host.get(client_host) {
            Some(previous) => previous.token.clone(),
            None => fresh_seed(client_host),
        };

        let now = Instant::now();
        let token = sha256_hex(&format!(
            "{seed}_{:.9}_{:.20}_{client_host}",
            unix_now(),
            rand::random::<f64>()
        ));
        state.seeds.push_back(seed);
        while state.seeds.len() > self.history {
            state.seeds.pop_front();
        }
        state.by_host.insert(
            client_host.to_string(),
            Issued {
                token: token.clone(),
                expires: Some(now + self.validity),
            },
        );
        state
            .by_host
            .retain(|_, issued| issued.expires.is_some_and(|t| now <= t));
        debug!(client = client_host, outstanding = state.by_host.len(), "issued admin token");

        AuthToken {
            token,
            valid_for: self.validity,
        }
    }

    /// Validate `token` for `client_host` and mark it consumed.
    pub fn consume(&self, client_host: &str, token: &str) -> AdminResult<()> {
        let mut state = self.state.lock().expect("token lock");
        let Some(current) = state.by_host.get_mut(client_host) else {
            return Err(AdminError::Permission("Not authorized".into()));
        };
        if current.token != token {
            return Err(AdminError::Permission("Invalid authtoken".into()));
        }
        match current.expires {
            Some(expires) if Instant::now() < expires => {
                current.expires = None;
                Ok(())
            }
            _ => Err(AdminError::Permission("Expired authtoken".into())),
        }
    }

    /// Seed of the most recently issued token, i.e. the token that
    /// preceded it for the same host.
    pub fn previous(&self) -> Option<String> {
        self.state.lock().expect("token lock").seeds.back().cloned()
    }
}

fn fresh_seed(host: &str) -> String {
    let mut rng = rand::thread_rng();
    let mut seed = sha256_hex(&Alphanumeric.sample_string(&mut rng, 64));
    for _ in 0..SEED_ROUNDS {
        let noise = Alphanumeric.sample_string(&mut rng, 64);
        seed = sha256_hex(&format!("{noise} {seed} {host}"));
    }
    seed
}

fn sha256_hex(input: &str) -> String {
    hex::encode(Sha256::digest(input.as_bytes()))
}

fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default()
}
