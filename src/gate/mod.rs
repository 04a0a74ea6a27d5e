//! Rate-limit gate: the admission check callers put in front of their work.
//!
//! The gate resolves who is calling, picks the limit that applies to them or
//! to the operation they are attempting, asks the [`ThrottleEngine`] and
//! hands back a [`GateDecision`]. Callers that get a refusal render it with
//! [`GateDecision::rejection`].

mod rejection;

use std::sync::Arc;
use tracing::{debug, warn};

use crate::config::TurnstileConfig;
use crate::identity::{ClientIdentityResolver, RequestMetadata};
use crate::ratelimit::{
    Operation, Principal, RateLimitPolicy, ThrottleEngine, ThrottleKey, ThrottleResult,
    TIER_NAMESPACE,
};

pub use rejection::{Rejection, RejectionConfig, REJECTION_MESSAGE};

/// An inbound call as seen by the gate.
#[derive(Debug, Clone)]
pub struct GateRequest {
    /// Transport details used to resolve the actor
    pub metadata: RequestMetadata,
    /// Authentication state of the caller
    pub principal: Principal,
    /// Actor key supplied by the application, bypassing resolution
    pub actor: Option<String>,
}

impl GateRequest {
    /// A call from an anonymous client.
    pub fn anonymous(metadata: RequestMetadata) -> Self {
        Self {
            metadata,
            principal: Principal::Anonymous,
            actor: None,
        }
    }

    /// A call from an authenticated user.
    pub fn authenticated(metadata: RequestMetadata, user_id: &str) -> Self {
        Self {
            metadata,
            principal: Principal::Authenticated(user_id.to_string()),
            actor: None,
        }
    }

    /// Count the call against `actor` instead of the resolved address.
    pub fn with_actor(mut self, actor: &str) -> Self {
        self.actor = Some(actor.to_string());
        self
    }
}

/// The gate's verdict for one call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GateDecision {
    /// Whether the caller may go ahead
    pub proceed: bool,
    /// Engine result behind the verdict, for telemetry
    pub result: ThrottleResult,
    rejection: RejectionConfig,
}

impl GateDecision {
    fn new(result: ThrottleResult, rejection: RejectionConfig) -> Self {
        Self {
            proceed: result.allowed,
            result,
            rejection,
        }
    }

    /// The rejection to render, or `None` if the call may proceed.
    pub fn rejection(&self) -> Option<Rejection> {
        if self.proceed {
            None
        } else {
            Some(Rejection::new(self.result.reset_seconds, self.rejection))
        }
    }
}

/// Admission gate composing identity resolution, limit selection and the
/// throttle engine.
pub struct RateLimitGate {
    engine: Arc<ThrottleEngine>,
    resolver: ClientIdentityResolver,
    policy: RateLimitPolicy,
    rejection: RejectionConfig,
}

impl RateLimitGate {
    /// Create a gate over a shared engine.
    pub fn new(
        engine: Arc<ThrottleEngine>,
        resolver: ClientIdentityResolver,
        policy: RateLimitPolicy,
    ) -> Self {
        Self {
            engine,
            resolver,
            policy,
            rejection: RejectionConfig::default(),
        }
    }

    /// Build a gate from configuration over a shared engine.
    ///
    /// The engine is created once per process and handed to every gate.
    pub fn from_config(config: &TurnstileConfig, engine: Arc<ThrottleEngine>) -> Self {
        let tiers = [
            ("anonymous", config.limits.anonymous),
            ("authenticated", config.limits.authenticated),
        ];
        for (tier, rule) in tiers {
            if rule.is_disabled() {
                warn!(tier, "Tier limit is disabled, these calls are not throttled");
            }
        }

        Self::new(
            engine,
            ClientIdentityResolver::new(config.identity.clone()),
            config.limits.clone(),
        )
        .with_rejection_config(config.rejection)
    }

    /// Change how rejections are rendered.
    pub fn with_rejection_config(mut self, rejection: RejectionConfig) -> Self {
        self.rejection = rejection;
        self
    }

    /// Get the limit policy.
    pub fn policy(&self) -> &RateLimitPolicy {
        &self.policy
    }

    /// Get the shared engine.
    pub fn engine(&self) -> &Arc<ThrottleEngine> {
        &self.engine
    }

    /// The actor a request is counted against.
    pub fn actor_for(&self, request: &GateRequest) -> String {
        match &request.actor {
            Some(actor) => actor.clone(),
            None => self.resolver.resolve(&request.metadata),
        }
    }

    /// Apply the per-tier ceiling to a request.
    ///
    /// Anonymous and authenticated callers share the key space of their
    /// actor but are held to different limits.
    pub async fn admit(&self, request: &GateRequest) -> GateDecision {
        let actor = self.actor_for(request);
        let rule = self.policy.tier(&request.principal);
        let key = ThrottleKey::new(TIER_NAMESPACE, &actor);

        let result = self
            .engine
            .check(&key.to_string_key(), rule.limit, rule.window_seconds)
            .await;

        if !result.allowed {
            debug!(
                authenticated = request.principal.is_authenticated(),
                "Request rejected by tier limit"
            );
        }
        GateDecision::new(result, self.rejection)
    }

    /// Apply a call-site limit.
    ///
    /// `scope` gives the actor an independent counter per sub-resource, for
    /// example one per conversation.
    pub async fn admit_operation(
        &self,
        operation: &Operation,
        actor: &str,
        scope: Option<&str>,
    ) -> GateDecision {
        let mut key = ThrottleKey::new(&operation.namespace, actor);
        if let Some(scope) = scope {
            key = key.with_scope(scope);
        }

        let result = self
            .engine
            .check(&key.to_string_key(), operation.rule.limit, operation.rule.window_seconds)
            .await;

        if !result.allowed {
            debug!(operation = %operation.namespace, "Request rejected by operation limit");
        }
        GateDecision::new(result, self.rejection)
    }

    /// Apply a call-site limit configured in the policy under `name`.
    ///
    /// An operation missing from the policy is not throttled; this is logged
    /// so the gap does not go unnoticed.
    pub async fn admit_named(&self, name: &str, actor: &str, scope: Option<&str>) -> GateDecision {
        match self.policy.operation(name) {
            Some(operation) => self.admit_operation(&operation, actor, scope).await,
            None => {
                warn!(operation = %name, "No limit configured for operation, not throttling");
                let unthrottled = Operation::new(name, 0, 0);
                self.admit_operation(&unthrottled, actor, scope).await
            }
        }
    }
}
