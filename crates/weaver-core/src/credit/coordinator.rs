//! Credit ledger coordinator.
//!
//! One ledger per execution, keyed by execution id in a `DashMap`. Every
//! mutation happens under the map's shard lock, so concurrent node completions
//! deducting from the same execution are serialized and can neither double
//! spend nor lose an update.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;
use weaver_types::config::CreditConfig;
use weaver_types::execution::NodeMetrics;
use weaver_types::workflow::NodeType;

use super::pricing;
use super::store::BoxCreditStore;
use super::CreditError;
use crate::workflow::compiler::CompiledPlan;
use crate::workflow::context::ExecutionContext;

/// Per-execution credit ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditLedgerState {
    pub account: String,
    pub estimated_total: u64,
    pub reserved: u64,
    pub spent: u64,
    /// Set when the ledger closes: `reserved - spent`.
    pub released: u64,
}

impl CreditLedgerState {
    pub fn remaining(&self) -> u64 {
        self.reserved.saturating_sub(self.spent)
    }
}

/// Final figures of a closed ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditSummary {
    pub estimated_total: u64,
    pub reserved: u64,
    pub spent: u64,
    pub released: u64,
}

pub struct CreditCoordinator {
    store: BoxCreditStore,
    config: CreditConfig,
    ledgers: DashMap<Uuid, CreditLedgerState>,
}

impl CreditCoordinator {
    pub fn new(store: BoxCreditStore, config: CreditConfig) -> Self {
        Self {
            store,
            config,
            ledgers: DashMap::new(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn config(&self) -> &CreditConfig {
        &self.config
    }

    /// Amount actually held for an estimate: the estimate plus the configured margin.
    pub fn reservation_for(&self, estimate: u64) -> u64 {
        let margin = self.config.estimate_margin.max(1.0);
        (estimate as f64 * margin).ceil() as u64
    }

    // -- Cost functions -----------------------------------------------------

    /// Credits for an LLM call with known token usage.
    pub fn calculate_llm_credits(&self, model: &str, input_tokens: u64, output_tokens: u64) -> u64 {
        let usd = pricing::estimate_cost(input_tokens, output_tokens, model, &self.config.llm_pricing);
        pricing::usd_to_credits(usd, self.config.credits_per_usd)
    }

    /// Fixed cost of a node type. Control nodes are free unless configured.
    pub fn fixed_node_cost(&self, node_type: NodeType) -> u64 {
        if let Some(cost) = self.config.node_costs.get(node_type.as_str()) {
            return *cost;
        }
        match node_type {
            NodeType::Input | NodeType::Output | NodeType::Loop | NodeType::Switch => 0,
            _ => self.config.default_node_cost,
        }
    }

    /// Credits for a completed node.
    ///
    /// Activity-reported credits win; LLM and vision nodes are priced from
    /// token usage when reported; everything else pays the fixed cost.
    pub fn calculate_node_credits(&self, node_type: NodeType, metrics: Option<&NodeMetrics>) -> u64 {
        if let Some(credits) = metrics.and_then(|m| m.credits) {
            return credits;
        }
        if matches!(node_type, NodeType::Llm | NodeType::Vision) {
            if let Some(m) = metrics {
                if m.input_tokens.is_some() || m.output_tokens.is_some() {
                    let model = m.model.as_deref().unwrap_or_default();
                    return self.calculate_llm_credits(
                        model,
                        m.input_tokens.unwrap_or(0),
                        m.output_tokens.unwrap_or(0),
                    );
                }
            }
        }
        self.fixed_node_cost(node_type)
    }

    /// Pre-flight estimate for a whole plan.
    ///
    /// LLM nodes are priced at the configured token estimate; loop bodies are
    /// multiplied by the iteration count when the source is a literal array or
    /// resolves from the inputs, otherwise by `max_iterations`.
    pub fn estimate_workflow_credits(&self, plan: &CompiledPlan, inputs: &Value) -> u64 {
        let scope = ExecutionContext::new(inputs.clone());
        self.estimate_scope(plan, &scope)
    }

    fn estimate_scope(&self, plan: &CompiledPlan, scope: &ExecutionContext) -> u64 {
        plan.nodes
            .values()
            .filter(|node| node.reachable)
            .map(|node| match plan.loop_context(&node.id) {
                Some(ctx) => {
                    let iterations = match &ctx.iterate_over {
                        Value::Array(items) => Some(items.len()),
                        Value::String(template) => scope
                            .resolve_str(template, &Default::default())
                            .ok()
                            .and_then(|v| v.as_array().map(Vec::len)),
                        _ => None,
                    }
                    .unwrap_or(ctx.max_iterations)
                    .min(ctx.max_iterations);
                    let body = self.estimate_scope(&ctx.body, scope);
                    self.fixed_node_cost(NodeType::Loop)
                        .saturating_add(u64::try_from(iterations).unwrap_or(u64::MAX).saturating_mul(body))
                }
                None if matches!(node.node_type, NodeType::Llm | NodeType::Vision) => {
                    let tokens = self.config.estimated_tokens_per_llm_node;
                    let model = node.config.get("model").and_then(Value::as_str).unwrap_or_default();
                    self.calculate_llm_credits(model, tokens / 2, tokens - tokens / 2)
                }
                None => self.fixed_node_cost(node.node_type),
            })
            .fold(0, u64::saturating_add)
    }

    // -- Ledger operations --------------------------------------------------

    /// Whether the account can cover the reservation for `estimate`.
    pub async fn should_allow_execution(&self, account: &str, estimate: u64) -> Result<bool, CreditError> {
        if !self.config.enabled {
            return Ok(true);
        }
        let available = self.store.balance(account).await?;
        Ok(available >= self.reservation_for(estimate))
    }

    /// Open the execution's ledger and hold its reservation.
    ///
    /// Returns `false`, with no ledger opened, when the account cannot cover it.
    pub async fn reserve_credits(
        &self,
        execution_id: Uuid,
        account: &str,
        estimate: u64,
    ) -> Result<bool, CreditError> {
        if self.ledgers.contains_key(&execution_id) {
            return Err(CreditError::AlreadyOpen(execution_id));
        }
        let reserved = if self.config.enabled {
            let amount = self.reservation_for(estimate);
            if !self.store.hold(account, execution_id, amount).await? {
                tracing::info!(%execution_id, account, amount, "credit reservation denied");
                return Ok(false);
            }
            amount
        } else {
            0
        };

        self.ledgers.insert(
            execution_id,
            CreditLedgerState {
                account: account.to_string(),
                estimated_total: estimate,
                reserved,
                spent: 0,
                released: 0,
            },
        );
        tracing::debug!(%execution_id, account, estimate, reserved, "credits reserved");
        Ok(true)
    }

    /// Charge a completed node against the reservation.
    ///
    /// Fails without charging when the remaining reservation cannot cover it.
    pub fn deduct(&self, execution_id: Uuid, node_id: &str, amount: u64) -> Result<u64, CreditError> {
        let mut ledger = self
            .ledgers
            .get_mut(&execution_id)
            .ok_or(CreditError::LedgerNotFound(execution_id))?;
        if !self.config.enabled || amount == 0 {
            return Ok(ledger.remaining());
        }
        let remaining = ledger.remaining();
        if amount > remaining {
            tracing::warn!(%execution_id, node_id, amount, remaining, "credit reservation exhausted");
            return Err(CreditError::Exhausted {
                execution_id,
                requested: amount,
                remaining,
            });
        }
        ledger.spent += amount;
        tracing::debug!(%execution_id, node_id, amount, spent = ledger.spent, "credits deducted");
        Ok(ledger.remaining())
    }

    /// Close the ledger after a failure or cancellation, returning what was not spent.
    pub async fn release_credits(&self, execution_id: Uuid) -> Result<CreditSummary, CreditError> {
        let summary = self.close(execution_id).await?;
        tracing::info!(%execution_id, released = summary.released, spent = summary.spent, "credits released");
        Ok(summary)
    }

    /// Close the ledger after a successful run, reconciling reserved against spent.
    pub async fn finalize_credits(&self, execution_id: Uuid) -> Result<CreditSummary, CreditError> {
        let summary = self.close(execution_id).await?;
        tracing::info!(%execution_id, spent = summary.spent, released = summary.released, "credits finalized");
        Ok(summary)
    }

    async fn close(&self, execution_id: Uuid) -> Result<CreditSummary, CreditError> {
        let (_, mut ledger) = self
            .ledgers
            .remove(&execution_id)
            .ok_or(CreditError::LedgerNotFound(execution_id))?;
        ledger.released = ledger.remaining();
        if self.config.enabled {
            self.store.settle(&ledger.account, execution_id, ledger.spent).await?;
        }
        Ok(CreditSummary {
            estimated_total: ledger.estimated_total,
            reserved: ledger.reserved,
            spent: ledger.spent,
            released: ledger.released,
        })
    }

    /// Current state of an open ledger.
    pub fn ledger(&self, execution_id: Uuid) -> Option<CreditLedgerState> {
        self.ledgers.get(&execution_id).map(|l| l.clone())
    }

    /// Re-open a ledger from a checkpoint. The store's hold is assumed to still exist.
    pub fn restore_ledger(&self, execution_id: Uuid, state: CreditLedgerState) -> Result<(), CreditError> {
        match self.ledgers.entry(execution_id) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(CreditError::AlreadyOpen(execution_id)),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(state);
                Ok(())
            }
        }
    }
}
