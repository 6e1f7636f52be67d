use serde::Serialize;

pub const MIN_MAX_ABSOLUTE_FEE_SAT: u64 = 5_000;
pub const MAX_MAX_ABSOLUTE_FEE_SAT: u64 = 100_000;
pub const MIN_MAX_RELATIVE_FEE_BASIS_POINTS: u64 = 10;
pub const MAX_MAX_RELATIVE_FEE_BASIS_POINTS: u64 = 500;
pub const MAX_MAX_ALLOWED_CREDIT_SAT: u64 = 100_000;

/// Caps on the on-chain fees the node will accept when buying inbound
/// liquidity, and on how much non-refundable fee credit may accumulate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiquidityPolicy {
    pub max_absolute_fee_sat: u64,
    pub max_relative_fee_basis_points: u64,
    pub max_allowed_credit_sat: u64,
    pub skip_absolute_fee_check: bool,
}

impl Default for LiquidityPolicy {
    fn default() -> Self {
        LiquidityPolicy {
            max_absolute_fee_sat: 40_000,
            max_relative_fee_basis_points: 300,
            max_allowed_credit_sat: 100_000,
            skip_absolute_fee_check: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    /// Accepting the payment as fee credit would exceed the credit cap.
    CreditFull,
    /// The quoted fee exceeds the absolute cap.
    OverAbsoluteFee,
    /// The quoted fee exceeds the relative cap.
    OverRelativeFee,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LiquidityDecision {
    /// Take the liquidity and pay the quoted fee.
    Accept,
    /// The payment is too small to carry the fee; convert the whole amount
    /// to fee credit instead.
    AcceptAsCredit { amount_msat: u64 },
    Reject { reason: RejectReason },
}

impl LiquidityPolicy {
    /// Clamps every field into its supported range.
    pub fn clamped(mut self) -> LiquidityPolicy {
        self.max_absolute_fee_sat = self
            .max_absolute_fee_sat
            .clamp(MIN_MAX_ABSOLUTE_FEE_SAT, MAX_MAX_ABSOLUTE_FEE_SAT);
        self.max_relative_fee_basis_points = self.max_relative_fee_basis_points.clamp(
            MIN_MAX_RELATIVE_FEE_BASIS_POINTS,
            MAX_MAX_RELATIVE_FEE_BASIS_POINTS,
        );
        self.max_allowed_credit_sat = self.max_allowed_credit_sat.min(MAX_MAX_ALLOWED_CREDIT_SAT);
        self
    }

    /// Decides whether to accept the on-chain fee burden for an incoming
    /// amount, convert the overflow to fee credit, or reject. Pure: the
    /// engine consults it synchronously for every funding attempt.
    pub fn decide(
        &self,
        amount_msat: u64,
        fee_msat: u64,
        fee_credit_msat: u64,
        channels_empty: bool,
    ) -> LiquidityDecision {
        // A zero fee means the funds fit existing channel capacity; there is
        // nothing to cap.
        if fee_msat == 0 && !channels_empty {
            return LiquidityDecision::Accept;
        }

        if amount_msat < fee_msat {
            let max_allowed_credit_msat = self.max_allowed_credit_sat * 1_000;
            return if fee_credit_msat + amount_msat <= max_allowed_credit_msat {
                LiquidityDecision::AcceptAsCredit { amount_msat }
            } else {
                LiquidityDecision::Reject {
                    reason: RejectReason::CreditFull,
                }
            };
        }

        if !self.skip_absolute_fee_check && fee_msat > self.max_absolute_fee_sat * 1_000 {
            return LiquidityDecision::Reject {
                reason: RejectReason::OverAbsoluteFee,
            };
        }

        if fee_msat * 10_000 > amount_msat * self.max_relative_fee_basis_points {
            return LiquidityDecision::Reject {
                reason: RejectReason::OverRelativeFee,
            };
        }

        LiquidityDecision::Accept
    }
}
