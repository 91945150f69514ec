//! Strategy selection and per-attempt request preparation.
//!
//! The policy owns the choice between the direct and challenge-capable
//! transports, draws a proxy from the pool when the descriptor does not pin
//! one, injects the domain's accumulated cookies, and captures `Set-Cookie`
//! values from successful attempts before the envelope is handed back.

use std::sync::{Arc, Mutex};

use http::header::{COOKIE, SET_COOKIE};
use http::HeaderValue;

use crate::modules::cookies::CookieStore;
use crate::modules::proxy::ProxyPool;

use super::{ProxySelection, RequestDescriptor, ResponseEnvelope, Transport, TransportError};

pub struct TransportPolicy {
    direct: Arc<dyn Transport>,
    challenge: Option<Arc<dyn Transport>>,
    proxies: Arc<Mutex<ProxyPool>>,
    cookies: CookieStore,
}

impl TransportPolicy {
    pub fn new(
        direct: Arc<dyn Transport>,
        challenge: Option<Arc<dyn Transport>>,
        proxies: Arc<Mutex<ProxyPool>>,
        cookies: CookieStore,
    ) -> Self {
        Self {
            direct,
            challenge,
            proxies,
            cookies,
        }
    }

    pub fn has_challenge_transport(&self) -> bool {
        self.challenge.is_some()
    }

    /// Execute one attempt. Returns the proxy id the attempt was routed
    /// through (if any) so the engine can feed the outcome back to the pool.
    pub async fn dispatch(
        &self,
        descriptor: &RequestDescriptor,
        use_challenge: bool,
    ) -> (Option<u64>, Result<ResponseEnvelope, TransportError>) {
        let mut prepared = descriptor.clone();

        if prepared.proxy.is_none() {
            let selection = {
                let mut pool = self.proxies.lock().expect("proxy pool lock poisoned");
                pool.next().map(|record| ProxySelection {
                    id: record.id,
                    endpoint: record.endpoint(),
                })
            };
            prepared.proxy = selection;
        }
        let proxy_id = prepared.proxy.as_ref().map(|p| p.id);

        if !prepared.headers.contains_key(COOKIE)
            && let Some(header) = self.cookies.header_for(prepared.domain())
            && let Ok(value) = HeaderValue::from_str(&header)
        {
            prepared.headers.insert(COOKIE, value);
        }

        let transport = if use_challenge {
            match self.challenge {
                Some(ref challenge) => challenge.clone(),
                None => {
                    return (
                        proxy_id,
                        Err(TransportError::ChallengeBlocked(
                            "no challenge-capable transport configured".into(),
                        )),
                    );
                }
            }
        } else {
            self.direct.clone()
        };

        let result = transport.send(&prepared).await;

        if let Ok(ref envelope) = result {
            self.capture_cookies(prepared.domain(), envelope);
        }

        (proxy_id, result)
    }

    fn capture_cookies(&self, domain: &str, envelope: &ResponseEnvelope) {
        for value in envelope.headers.get_all(SET_COOKIE).iter() {
            if let Ok(raw) = value.to_str() {
                // Only the leading name=value pair carries state; Path,
                // Expires, and the other attributes are not cookies.
                let pair = raw.split(';').next().unwrap_or(raw);
                self.cookies.record(domain, pair);
            }
        }
    }
}
