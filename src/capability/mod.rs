//! Capability trait and registry
//!
//! A capability is one named operation with a fixed input/output contract.
//! Providers are opaque: the registry validates arguments, delegates, and
//! checks the output shape. It never retries.

use crate::config::OrchestratorConfig;
use crate::error::OrchestrationError;
use crate::Result;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

pub mod fixtures;
pub mod http;
pub mod local;

/// Capability names used by the advisory workflow
pub mod names {
    pub const USER_PROFILE: &str = "user_profile";
    pub const HISTORICAL_PRICES: &str = "historical_prices";
    pub const NEWS_DOCUMENTS: &str = "news_documents";
    pub const REPORT_DOCUMENTS: &str = "report_documents";
    pub const SENTIMENT_SCORING: &str = "sentiment_scoring";
    pub const STRATEGY_GENERATION: &str = "strategy_generation";
    pub const MARKET_ANALYSIS: &str = "market_analysis";
    pub const INDUSTRY_TRENDS: &str = "industry_trends";
    pub const FINANCIAL_RATIOS: &str = "financial_ratios";
    pub const PORTFOLIO_MANAGEMENT: &str = "portfolio_management";
    pub const ADVICE_SYNTHESIS: &str = "advice_synthesis";
    pub const PORTFOLIO_OPTIMIZATION: &str = super::local::PORTFOLIO_OPTIMIZATION;
    pub const RISK_ASSESSMENT: &str = super::local::RISK_ASSESSMENT;
    pub const TRADE_INSTRUCTIONS: &str = super::local::TRADE_INSTRUCTIONS;
    pub const TRADE_EXECUTION: &str = "trade_execution";
}

//
// ================= Contracts =================
//

/// JSON shape accepted by a parameter or produced by a capability
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ValueKind {
    String,
    Number,
    Boolean,
    Array,
    Object,
    Any,
}

impl ValueKind {
    pub fn accepts(&self, value: &Value) -> bool {
        match self {
            ValueKind::String => value.is_string(),
            ValueKind::Number => value.is_number(),
            ValueKind::Boolean => value.is_boolean(),
            ValueKind::Array => value.is_array(),
            ValueKind::Object => value.is_object(),
            ValueKind::Any => true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParameterSchema {
    pub name: String,
    pub kind: ValueKind,
    #[serde(default)]
    pub required: bool,
}

impl ParameterSchema {
    pub fn required(name: &str, kind: ValueKind) -> Self {
        Self {
            name: name.to_string(),
            kind,
            required: true,
        }
    }

    pub fn optional(name: &str, kind: ValueKind) -> Self {
        Self {
            name: name.to_string(),
            kind,
            required: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilitySchema {
    pub name: String,
    pub inputs: Vec<ParameterSchema>,
    pub output: ValueKind,
}

impl CapabilitySchema {
    fn check_arguments(&self, request: &CapabilityRequest) -> Result<()> {
        let mismatch = |reason: String| OrchestrationError::ArgumentMismatch {
            capability: self.name.clone(),
            reason,
        };

        for argument in &request.arguments {
            let param = self
                .inputs
                .iter()
                .find(|p| p.name == argument.name)
                .ok_or_else(|| mismatch(format!("undeclared argument '{}'", argument.name)))?;

            if !param.kind.accepts(&argument.value) {
                return Err(mismatch(format!(
                    "argument '{}' expected {:?}",
                    argument.name, param.kind
                )));
            }
        }

        for param in self.inputs.iter().filter(|p| p.required) {
            if request.get(&param.name).is_none() {
                return Err(mismatch(format!("missing required argument '{}'", param.name)));
            }
        }

        Ok(())
    }
}

//
// ================= Request =================
//

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Argument {
    pub name: String,
    pub value: Value,
}

/// One invocation: a capability name plus ordered, named arguments
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CapabilityRequest {
    pub capability: String,
    pub arguments: Vec<Argument>,
}

impl CapabilityRequest {
    pub fn new(capability: impl Into<String>) -> Self {
        Self {
            capability: capability.into(),
            arguments: Vec::new(),
        }
    }

    pub fn arg(mut self, name: impl Into<String>, value: Value) -> Self {
        self.arguments.push(Argument {
            name: name.into(),
            value,
        });
        self
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.arguments
            .iter()
            .find(|a| a.name == name)
            .map(|a| &a.value)
    }

    /// Deserialize a required argument into a typed value
    pub fn require<T: DeserializeOwned>(&self, name: &str) -> Result<T> {
        let value = self.get(name).ok_or_else(|| OrchestrationError::ArgumentMismatch {
            capability: self.capability.clone(),
            reason: format!("missing required argument '{}'", name),
        })?;

        serde_json::from_value(value.clone()).map_err(|e| OrchestrationError::ArgumentMismatch {
            capability: self.capability.clone(),
            reason: format!("argument '{}' is malformed: {}", name, e),
        })
    }

    /// Deserialize an optional argument; `null` counts as absent
    pub fn optional<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>> {
        match self.get(name) {
            None | Some(Value::Null) => Ok(None),
            Some(_) => self.require(name).map(Some),
        }
    }

    /// Arguments as a JSON object, for providers that speak JSON bodies
    pub fn arguments_object(&self) -> Value {
        let map: serde_json::Map<String, Value> = self
            .arguments
            .iter()
            .map(|a| (a.name.clone(), a.value.clone()))
            .collect();
        Value::Object(map)
    }
}

//
// ================= Provider =================
//

/// A single capability provider. Calls may block on network or compute.
#[async_trait::async_trait]
pub trait Capability: Send + Sync {
    async fn invoke(&self, request: &CapabilityRequest) -> Result<Value>;
}

/// Adapts a synchronous closure into a capability
pub struct FnCapability<F> {
    handler: F,
}

impl<F> FnCapability<F>
where
    F: Fn(&CapabilityRequest) -> Result<Value> + Send + Sync,
{
    pub fn new(handler: F) -> Self {
        Self { handler }
    }
}

#[async_trait::async_trait]
impl<F> Capability for FnCapability<F>
where
    F: Fn(&CapabilityRequest) -> Result<Value> + Send + Sync,
{
    async fn invoke(&self, request: &CapabilityRequest) -> Result<Value> {
        (self.handler)(request)
    }
}

//
// ================= Registry =================
//

struct RegisteredCapability {
    schema: CapabilitySchema,
    provider: Arc<dyn Capability>,
}

/// Name-indexed table of capability providers
#[derive(Default)]
pub struct CapabilityRegistry {
    capabilities: BTreeMap<String, RegisteredCapability>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        name: impl Into<String>,
        provider: Arc<dyn Capability>,
        inputs: Vec<ParameterSchema>,
        output: ValueKind,
    ) -> Result<()> {
        let name = name.into();
        if self.capabilities.contains_key(&name) {
            return Err(OrchestrationError::DuplicateCapability(name));
        }

        let schema = CapabilitySchema {
            name: name.clone(),
            inputs,
            output,
        };
        self.capabilities
            .insert(name, RegisteredCapability { schema, provider });
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.capabilities.contains_key(name)
    }

    pub fn schema(&self, name: &str) -> Option<&CapabilitySchema> {
        self.capabilities.get(name).map(|c| &c.schema)
    }

    pub fn list(&self) -> Vec<&str> {
        self.capabilities.keys().map(|s| s.as_str()).collect()
    }

    pub async fn invoke(&self, request: &CapabilityRequest) -> Result<Value> {
        let entry = self
            .capabilities
            .get(&request.capability)
            .ok_or_else(|| OrchestrationError::UnknownCapability(request.capability.clone()))?;

        entry.schema.check_arguments(request)?;

        debug!(capability = %request.capability, "Invoking capability");

        let output = entry.provider.invoke(request).await.map_err(|e| {
            if e.is_domain_error() {
                e
            } else {
                OrchestrationError::CapabilityFailure {
                    capability: request.capability.clone(),
                    cause: e.to_string(),
                }
            }
        })?;

        if !entry.schema.output.accepts(&output) {
            return Err(OrchestrationError::CapabilityFailure {
                capability: request.capability.clone(),
                cause: format!("output does not match declared {:?}", entry.schema.output),
            });
        }

        Ok(output)
    }
}

//
// ================= Default Registry =================
//

/// Contracts of the externally provided capabilities
pub fn external_contracts() -> Vec<CapabilitySchema> {
    use ParameterSchema as P;
    use ValueKind::*;

    let contract = |name: &str, inputs: Vec<ParameterSchema>, output: ValueKind| CapabilitySchema {
        name: name.to_string(),
        inputs,
        output,
    };

    vec![
        contract(names::USER_PROFILE, vec![P::required("profile", Object)], Object),
        contract(
            names::HISTORICAL_PRICES,
            vec![
                P::required("ticker", String),
                P::required("start_date", String),
                P::required("end_date", String),
            ],
            Object,
        ),
        contract(names::NEWS_DOCUMENTS, vec![P::required("directory", String)], Array),
        contract(names::REPORT_DOCUMENTS, vec![P::required("directory", String)], Array),
        contract(names::SENTIMENT_SCORING, vec![P::required("texts", Array)], Object),
        contract(
            names::STRATEGY_GENERATION,
            vec![
                P::required("price_series", Array),
                P::required("sentiment", Object),
                P::required("risk_tolerance", Any),
            ],
            String,
        ),
        contract(names::MARKET_ANALYSIS, vec![P::required("price_series", Array)], Object),
        contract(names::INDUSTRY_TRENDS, vec![P::required("ticker", String)], Object),
        contract(names::FINANCIAL_RATIOS, vec![P::required("price_series", Array)], Object),
        contract(
            names::PORTFOLIO_MANAGEMENT,
            vec![P::required("risk_tolerance", Any)],
            Object,
        ),
        contract(
            names::ADVICE_SYNTHESIS,
            vec![
                P::required("profile", Object),
                P::required("strategy", String),
                P::required("market_analysis", Any),
                P::required("industry_trends", Any),
                P::required("financial_ratios", Any),
                P::required("portfolio_management", Any),
            ],
            String,
        ),
        contract(
            names::TRADE_EXECUTION,
            vec![
                P::required("ticker", String),
                P::required("action", String),
                P::required("quantity", Number),
            ],
            Object,
        ),
    ]
}

/// Build the registry for a run: remote providers when a capability service is
/// configured, offline fixtures otherwise; compute capabilities are always local.
pub fn create_default_registry(config: &OrchestratorConfig) -> Result<CapabilityRegistry> {
    let mut registry = CapabilityRegistry::new();

    match &config.capability_api_base_url {
        Some(base_url) => {
            info!(base_url = %base_url, "Using remote capability providers");
            let client = http::CapabilityApiClient::new(base_url)?;
            for contract in external_contracts() {
                registry.register(
                    contract.name,
                    Arc::new(http::HttpCapability::new(client.clone())),
                    contract.inputs,
                    contract.output,
                )?;
            }
        }
        None => {
            info!("Using offline capability providers");
            let mut providers: BTreeMap<&str, Arc<dyn Capability>> =
                fixtures::offline_providers().into_iter().collect();
            for contract in external_contracts() {
                let provider = providers.remove(contract.name.as_str()).ok_or_else(|| {
                    OrchestrationError::Configuration(format!(
                        "no offline provider for '{}'",
                        contract.name
                    ))
                })?;
                registry.register(contract.name, provider, contract.inputs, contract.output)?;
            }
        }
    }

    local::register_local(&mut registry, config)?;
    Ok(registry)
}
