use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tower_layer::Layer;
use tower_service::Service;

use crate::error::AdmissionError;
use crate::gate::{AdmissionGate, GateDecision};
use crate::resolver::RequestContext;

/// Called with the gate's decision on every admitted response, e.g. to write
/// `X-RateLimit-*` headers from [`GateDecision::headers`].
///
/// Implemented for [`NoHook`] and for any `Fn(&GateDecision, &mut Resp)`.
pub trait AdmittedHook<Resp>: Send + Sync + 'static {
    fn on_admitted(&self, decision: &GateDecision, response: &mut Resp);
}

/// Hook that does nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoHook;

impl<Resp> AdmittedHook<Resp> for NoHook {
    fn on_admitted(&self, _decision: &GateDecision, _response: &mut Resp) {}
}

impl<Resp, H> AdmittedHook<Resp> for H
where
    H: Fn(&GateDecision, &mut Resp) + Send + Sync + 'static,
{
    fn on_admitted(&self, decision: &GateDecision, response: &mut Resp) {
        self(decision, response)
    }
}

/// A layer that admits requests through an [`AdmissionGate`].
///
/// `extract` builds the gate's view of a request (caller address, user, route, plan);
/// how that is read from headers or sessions is up to the pipeline.
pub struct AdmissionLayer<F, H = NoHook> {
    gate: Arc<AdmissionGate>,
    extract: Arc<F>,
    hook: Arc<H>,
}

impl<F> AdmissionLayer<F> {
    /// Create a new admission layer.
    pub fn new(gate: Arc<AdmissionGate>, extract: F) -> Self {
        Self { gate, extract: Arc::new(extract), hook: Arc::new(NoHook) }
    }
}

impl<F, H> AdmissionLayer<F, H> {
    /// Run `hook` on every admitted response with the decision that admitted it.
    /// Rejections already carry theirs in [`AdmissionError::Rejected`].
    pub fn on_admitted<H2>(self, hook: H2) -> AdmissionLayer<F, H2> {
        AdmissionLayer { gate: self.gate, extract: self.extract, hook: Arc::new(hook) }
    }
}

impl<F, H> Clone for AdmissionLayer<F, H> {
    fn clone(&self) -> Self {
        Self { gate: self.gate.clone(), extract: self.extract.clone(), hook: self.hook.clone() }
    }
}

impl<F, H> std::fmt::Debug for AdmissionLayer<F, H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionLayer").field("gate", &self.gate).finish_non_exhaustive()
    }
}

impl<S, F, H> Layer<S> for AdmissionLayer<F, H> {
    type Service = AdmissionService<S, F, H>;

    fn layer(&self, service: S) -> Self::Service {
        AdmissionService {
            inner: service,
            gate: self.gate.clone(),
            extract: self.extract.clone(),
            hook: self.hook.clone(),
        }
    }
}

/// Middleware service that enforces admission decisions.
pub struct AdmissionService<S, F, H = NoHook> {
    inner: S,
    gate: Arc<AdmissionGate>,
    extract: Arc<F>,
    hook: Arc<H>,
}

impl<S: Clone, F, H> Clone for AdmissionService<S, F, H> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            gate: self.gate.clone(),
            extract: self.extract.clone(),
            hook: self.hook.clone(),
        }
    }
}

impl<S: std::fmt::Debug, F, H> std::fmt::Debug for AdmissionService<S, F, H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionService")
            .field("inner", &self.inner)
            .field("gate", &self.gate)
            .finish_non_exhaustive()
    }
}

impl<S, F, H, Req> Service<Req> for AdmissionService<S, F, H>
where
    S: Service<Req> + Clone + Send + 'static,
    S::Future: Send + 'static,
    F: Fn(&Req) -> RequestContext + Send + Sync + 'static,
    H: AdmittedHook<S::Response>,
    Req: Send + 'static,
{
    type Response = S::Response;
    type Error = AdmissionError<S::Error>;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(AdmissionError::Inner)
    }

    fn call(&mut self, req: Req) -> Self::Future {
        let ctx = (self.extract)(&req);
        let gate = self.gate.clone();
        let hook = self.hook.clone();
        // take the service that was polled ready, leave a fresh clone behind
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        Box::pin(async move {
            // charged before the inner call; a cancelled request keeps its charge
            let decision = gate.evaluate(&ctx).await;
            if !decision.allowed {
                return Err(AdmissionError::Rejected(decision));
            }
            let mut response = inner.call(req).await.map_err(AdmissionError::Inner)?;
            hook.on_admitted(&decision, &mut response);
            Ok(response)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::rate_limit::tier::TierName;
    use std::convert::Infallible;
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tower::{service_fn, ServiceExt};

    const PEER: IpAddr = IpAddr::V4(Ipv4Addr::new(192, 0, 2, 44));

    #[tokio::test]
    async fn rejects_after_anonymous_burst_without_calling_inner() {
        let gate = Arc::new(AdmissionGate::builder().clock(ManualClock::new(0)).build().unwrap());
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let svc = service_fn(move |path: String| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<_, Infallible>(path)
            }
        });
        let layer = AdmissionLayer::new(gate, |path: &String| RequestContext::new(PEER, path.clone()));
        let svc = layer.layer(svc);

        for _ in 0..15 {
            let res = svc.clone().oneshot("/students".to_string()).await;
            assert_eq!(res.unwrap(), "/students");
        }
        let err = svc.clone().oneshot("/students".to_string()).await.unwrap_err();
        assert!(err.is_rejected());
        let decision = err.decision().unwrap();
        assert_eq!(decision.limiting_tier, Some(TierName::Anonymous));
        assert_eq!(decision.retry_after_seconds, Some(6));
        assert_eq!(calls.load(Ordering::SeqCst), 15);
    }

    #[tokio::test]
    async fn admitted_responses_see_the_decision() {
        let gate = Arc::new(AdmissionGate::builder().clock(ManualClock::new(0)).build().unwrap());
        let svc = service_fn(|_: ()| async { Ok::<_, Infallible>(Vec::<(&'static str, String)>::new()) });
        let layer = AdmissionLayer::new(gate, |_: &()| RequestContext::new(PEER, "/"))
            .on_admitted(|decision: &GateDecision, headers: &mut Vec<(&'static str, String)>| {
                headers.extend(decision.headers());
            });
        let svc = layer.layer(svc);

        let headers = svc.clone().oneshot(()).await.unwrap();
        assert!(headers.contains(&("X-RateLimit-Limit", "15".to_string())));
        assert!(headers.contains(&("X-RateLimit-Remaining", "14".to_string())));
        assert!(headers.contains(&("X-RateLimit-Window", "60".to_string())));
        assert!(!headers.iter().any(|(name, _)| *name == "Retry-After"));

        let headers = svc.oneshot(()).await.unwrap();
        assert!(headers.contains(&("X-RateLimit-Remaining", "13".to_string())));
    }

    #[tokio::test]
    async fn inner_errors_pass_through() {
        let gate = Arc::new(AdmissionGate::local_default().unwrap());
        let svc = service_fn(|_: ()| async {
            Err::<(), _>(std::io::Error::new(std::io::ErrorKind::Other, "downstream"))
        });
        let svc = AdmissionLayer::new(gate, |_: &()| RequestContext::new(PEER, "/")).layer(svc);
        let err = svc.oneshot(()).await.unwrap_err();
        assert!(!err.is_rejected());
        assert_eq!(err.into_inner().map(|e| e.to_string()), Some("downstream".to_string()));
    }
}
