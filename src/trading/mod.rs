//! Trade instruction derivation
//!
//! Turns a solved allocation and an investment amount into per-asset
//! instructions. Pure and deterministic; execution is a separate capability.

use crate::error::OrchestrationError;
use crate::models::{Allocation, TradeAction, TradeInstruction};
use crate::Result;
use std::collections::BTreeMap;

/// Deltas smaller than half a cent are treated as no trade
const MIN_TRADE_NOTIONAL: f64 = 0.005;

pub fn derive_instructions(
    allocation: &Allocation,
    investment_amount: f64,
    holdings: &BTreeMap<String, f64>,
) -> Result<Vec<TradeInstruction>> {
    if !investment_amount.is_finite() || investment_amount < 0.0 {
        return Err(OrchestrationError::InvalidInput(format!(
            "investment amount must be non-negative, got {}",
            investment_amount
        )));
    }

    let mut instructions: Vec<TradeInstruction> = allocation
        .assets
        .iter()
        .map(|asset| {
            let target = asset.weight * investment_amount;
            let current = holdings.get(&asset.ticker).copied().unwrap_or(0.0);
            instruction_for(&asset.ticker, target - current)
        })
        .collect();

    // Positions outside the allocation are closed out.
    instructions.extend(
        holdings
            .iter()
            .filter(|(ticker, _)| !allocation.assets.iter().any(|a| &a.ticker == *ticker))
            .map(|(ticker, amount)| instruction_for(ticker, -amount)),
    );

    Ok(instructions)
}

fn instruction_for(ticker: &str, delta: f64) -> TradeInstruction {
    let (action, quantity) = if delta > MIN_TRADE_NOTIONAL {
        (TradeAction::Buy, round_cents(delta))
    } else if delta < -MIN_TRADE_NOTIONAL {
        (TradeAction::Sell, round_cents(-delta))
    } else {
        (TradeAction::Hold, 0.0)
    };

    TradeInstruction {
        ticker: ticker.to_string(),
        action,
        quantity,
    }
}

fn round_cents(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
