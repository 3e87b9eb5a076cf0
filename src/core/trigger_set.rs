//! Turns the configured functions and triggers into a router and installs it.
use std::{collections::HashMap, sync::Arc};

use axum::{
    Json, Router,
    extract::Request,
    routing::{MethodFilter, MethodRouter, any, get, on, post},
};
use chrono::{DateTime, Utc};
use serde_json::json;
use tower_http::trace::TraceLayer;

use crate::{
    config::{
        models::{FunctionConfig, FunctionReference, TriggerConfig},
        validation::{
            AgentConfigValidator, FUNCTION_OUTPUT_SUFFIX, HEALTH_PATH, ValidationError,
            ValidationResult, parse_method_filter,
        },
    },
    core::{
        canary::WeightedVariants,
        forwarder::RouteBinding,
        function::FunctionSpec,
        invocation::{FunctionTarget, InvocationContext, InvocationHandler},
        route_table::MutableRouteTable,
    },
};

/// What an `apply` installed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouteSummary {
    pub functions: usize,
    pub triggers: usize,
}

/// Owns the route table and rebuilds it whenever the trigger set changes.
pub struct TriggerSet {
    ctx: Arc<InvocationContext>,
    table: Arc<MutableRouteTable>,
    started_at: DateTime<Utc>,
}

impl TriggerSet {
    pub fn new(ctx: Arc<InvocationContext>, table: Arc<MutableRouteTable>) -> Self {
        Self {
            ctx,
            table,
            started_at: Utc::now(),
        }
    }

    pub fn table(&self) -> &Arc<MutableRouteTable> {
        &self.table
    }

    /// Validates, builds and installs a new table. On error the installed table
    /// is left untouched.
    pub fn apply(
        &self,
        functions: &[FunctionConfig],
        triggers: &[TriggerConfig],
    ) -> ValidationResult<RouteSummary> {
        AgentConfigValidator::validate_triggers(functions, triggers).map_err(|errors| {
            ValidationError::ValidationFailed {
                message: AgentConfigValidator::format_multiple_errors(errors),
            }
        })?;

        let router = self.build_router(functions, triggers)?;
        self.table.replace(router);

        let summary = RouteSummary {
            functions: functions.len(),
            triggers: triggers.len(),
        };
        tracing::info!(
            functions = summary.functions,
            triggers = summary.triggers,
            "Installed new route table"
        );
        Ok(summary)
    }

    /// Builds the router for an already validated trigger set.
    pub fn build_router(
        &self,
        functions: &[FunctionConfig],
        triggers: &[TriggerConfig],
    ) -> ValidationResult<Router> {
        let specs: HashMap<(&str, &str), Arc<FunctionSpec>> = functions
            .iter()
            .map(|f| ((f.namespace.as_str(), f.name.as_str()), Arc::new(f.to_spec())))
            .collect();

        let mut router = Router::new();

        for spec in specs.values() {
            let url = spec.identity.default_url();
            let handler = Arc::new(InvocationHandler::new(
                Arc::clone(&self.ctx),
                FunctionTarget::Single(Arc::clone(spec)),
                RouteBinding::default(),
                url.clone(),
            ));
            router = router
                .route(&url, invoke_route(&handler, None))
                .route(&format!("{url}/{{*rest}}"), invoke_route(&handler, None))
                .route(&format!("{url}{FUNCTION_OUTPUT_SUFFIX}"), callback_route(&handler));
        }

        for trigger in triggers {
            let Some(base) = trigger.base_path() else {
                continue;
            };
            let target = self.target_for(trigger, &specs)?;
            let filter = method_filter(&trigger.methods);

            let (binding, route_path) = match &trigger.prefix {
                Some(prefix) => (RouteBinding::prefix(base.clone(), trigger.keep_prefix), prefix.clone()),
                None => (RouteBinding::default(), base.clone()),
            };
            let handler = Arc::new(InvocationHandler::new(
                Arc::clone(&self.ctx),
                target,
                binding,
                route_path,
            ));

            router = router.route(&base, invoke_route(&handler, filter));
            if trigger.prefix.is_some() {
                router = router.route(&format!("{base}/{{*rest}}"), invoke_route(&handler, filter));
            }
            router = router.route(&format!("{base}{FUNCTION_OUTPUT_SUFFIX}"), callback_route(&handler));
            tracing::debug!(trigger = %trigger.name, path = %base, "Mounted trigger");
        }

        let ctx = Arc::clone(&self.ctx);
        let started_at = self.started_at;
        let function_count = functions.len();
        let trigger_count = triggers.len();
        Ok(router.layer(TraceLayer::new_for_http()).route(
            HEALTH_PATH,
            get(move || {
                let ctx = Arc::clone(&ctx);
                async move {
                    Json(json!({
                        "status": "ok",
                        "functions": function_count,
                        "triggers": trigger_count,
                        "service_entries": ctx.addresses.service_entries(),
                        "pod_entries": ctx.addresses.pod_entries(),
                        "pending_rendezvous": ctx.rendezvous.pending(),
                        "issued_correlations": ctx.rendezvous.issued(),
                        "started_at": started_at.to_rfc3339(),
                        "timestamp": Utc::now().to_rfc3339(),
                    }))
                }
            }),
        ))
    }

    fn target_for(
        &self,
        trigger: &TriggerConfig,
        specs: &HashMap<(&str, &str), Arc<FunctionSpec>>,
    ) -> ValidationResult<FunctionTarget> {
        let lookup = |name: &str| {
            specs
                .get(&(trigger.namespace.as_str(), name))
                .cloned()
                .ok_or_else(|| ValidationError::UnknownFunction {
                    trigger: trigger.name.clone(),
                    function: format!("{}/{name}", trigger.namespace),
                })
        };

        match &trigger.function {
            FunctionReference::Name { name } => Ok(FunctionTarget::Single(lookup(name)?)),
            FunctionReference::Weights { functions } => {
                let variants = WeightedVariants::new(
                    functions.iter().map(|f| (f.name.clone(), f.weight)),
                )
                .map_err(|e| ValidationError::InvalidField {
                    field: format!("triggers.{}.function", trigger.name),
                    message: e.to_string(),
                })?;
                let functions = functions
                    .iter()
                    .map(|f| lookup(&f.name))
                    .collect::<ValidationResult<Vec<_>>>()?;
                Ok(FunctionTarget::Weighted {
                    variants,
                    functions,
                })
            }
        }
    }
}

/// Union of the trigger's methods; `None` accepts any method.
fn method_filter(methods: &[String]) -> Option<MethodFilter> {
    methods
        .iter()
        .filter_map(|m| parse_method_filter(m))
        .reduce(MethodFilter::or)
}

fn invoke_route(handler: &Arc<InvocationHandler>, filter: Option<MethodFilter>) -> MethodRouter {
    let handler = Arc::clone(handler);
    let serve = move |request: Request| {
        let handler = Arc::clone(&handler);
        async move { handler.handle(request).await }
    };
    match filter {
        Some(filter) => on(filter, serve),
        None => any(serve),
    }
}

fn callback_route(handler: &Arc<InvocationHandler>) -> MethodRouter {
    let handler = Arc::clone(handler);
    post(move |request: Request| {
        let handler = Arc::clone(&handler);
        async move { handler.function_output(request).await }
    })
}
