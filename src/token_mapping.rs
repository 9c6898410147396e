//! Token mapping table and decimal conversion
//!
//! The table is read-only after startup. Unknown source tokens are treated
//! as the chain-native coin (EVM 18 decimals, SOL 9 decimals).
//!
//! Conversion is exact when the destination has at least as many decimals
//! as the source; otherwise it floors and the remainder is reported as dust.

use serde::Deserialize;
use std::collections::HashMap;
use tracing::debug;

use crate::error::BridgeError;
use crate::types::Direction;

pub const EVM_NATIVE_DECIMALS: u8 = 18;
pub const SOL_NATIVE_DECIMALS: u8 = 9;

/// Rounding applied when destination decimals are fewer than source decimals
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TruncationPolicy {
    Floor,
}

pub const TRUNCATION_POLICY: TruncationPolicy = TruncationPolicy::Floor;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenMapping {
    pub direction: Direction,
    pub source_address: String,
    pub destination_address: String,
    pub source_decimals: u8,
    pub destination_decimals: u8,
}

/// What the destination leg pays out
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PayoutAsset {
    Native,
    Token { address: String, decimals: u8 },
}

impl PayoutAsset {
    pub fn token_address(&self) -> Option<&str> {
        match self {
            PayoutAsset::Native => None,
            PayoutAsset::Token { address, .. } => Some(address),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetRoute {
    pub asset: PayoutAsset,
    pub source_decimals: u8,
    pub destination_decimals: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Converted {
    pub amount: u128,
    /// Source units lost to floor truncation
    pub dust: u128,
}

#[derive(Debug, Clone, Default)]
pub struct TokenMappingTable {
    by_source: HashMap<(Direction, String), TokenMapping>,
}

/// EVM hex addresses compare case-insensitively; base58 keys do not
fn normalize(address: &str) -> String {
    let trimmed = address.trim();
    if trimmed.starts_with("0x") || trimmed.starts_with("0X") {
        trimmed.to_ascii_lowercase()
    } else {
        trimmed.to_string()
    }
}

fn native_decimals(direction: Direction) -> (u8, u8) {
    match direction {
        Direction::EvmToSol => (EVM_NATIVE_DECIMALS, SOL_NATIVE_DECIMALS),
        Direction::SolToEvm => (SOL_NATIVE_DECIMALS, EVM_NATIVE_DECIMALS),
    }
}

impl TokenMappingTable {
    pub fn new(mappings: Vec<TokenMapping>) -> Result<Self, BridgeError> {
        let mut by_source = HashMap::new();
        for mapping in mappings {
            let key = (mapping.direction, normalize(&mapping.source_address));
            if by_source.insert(key, mapping.clone()).is_some() {
                return Err(BridgeError::Validation(format!(
                    "duplicate token mapping for {} ({})",
                    mapping.source_address, mapping.direction
                )));
            }
        }
        Ok(Self { by_source })
    }

    /// Parse the JSON array form used by TOKEN_MAPPINGS
    pub fn from_json(raw: &str) -> Result<Self, BridgeError> {
        let mappings: Vec<TokenMapping> = serde_json::from_str(raw)
            .map_err(|e| BridgeError::Validation(format!("invalid token mappings: {}", e)))?;
        Self::new(mappings)
    }

    pub fn len(&self) -> usize {
        self.by_source.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_source.is_empty()
    }

    pub fn get(&self, direction: Direction, source_token: &str) -> Option<&TokenMapping> {
        self.by_source.get(&(direction, normalize(source_token)))
    }

    /// Destination asset and decimals pair for a source token
    pub fn resolve(&self, direction: Direction, source_token: &str) -> AssetRoute {
        match self.get(direction, source_token) {
            Some(m) => AssetRoute {
                asset: PayoutAsset::Token {
                    address: m.destination_address.clone(),
                    decimals: m.destination_decimals,
                },
                source_decimals: m.source_decimals,
                destination_decimals: m.destination_decimals,
            },
            None => {
                let (source_decimals, destination_decimals) = native_decimals(direction);
                AssetRoute {
                    asset: PayoutAsset::Native,
                    source_decimals,
                    destination_decimals,
                }
            }
        }
    }

    /// Resolve and convert in one step
    pub fn convert(
        &self,
        direction: Direction,
        source_token: &str,
        amount: u128,
    ) -> Result<(AssetRoute, Converted), BridgeError> {
        let route = self.resolve(direction, source_token);
        let converted = convert_amount(amount, route.source_decimals, route.destination_decimals)?;
        if converted.dust > 0 {
            debug!(
                direction = %direction,
                source_token,
                amount = %amount,
                dust = %converted.dust,
                policy = ?TRUNCATION_POLICY,
                "Decimal conversion truncated dust"
            );
        }
        Ok((route, converted))
    }
}

/// Convert an amount between decimal bases.
///
/// Multiplies by `10^(to - from)` when widening (overflow is a validation
/// error), floor-divides by `10^(from - to)` when narrowing.
pub fn convert_amount(amount: u128, from: u8, to: u8) -> Result<Converted, BridgeError> {
    if to >= from {
        let factor = 10u128.checked_pow(u32::from(to - from)).ok_or_else(|| {
            BridgeError::Validation(format!("decimal gap {} too large", to - from))
        })?;
        let scaled = amount.checked_mul(factor).ok_or_else(|| {
            BridgeError::Validation(format!(
                "amount {} overflows when scaled from {} to {} decimals",
                amount, from, to
            ))
        })?;
        return Ok(Converted {
            amount: scaled,
            dust: 0,
        });
    }

    match 10u128.checked_pow(u32::from(from - to)) {
        Some(divisor) => Ok(Converted {
            amount: amount / divisor,
            dust: amount % divisor,
        }),
        // divisor exceeds u128::MAX, so every representable amount floors to 0
        None => Ok(Converted {
            amount: 0,
            dust: amount,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn usdc_table() -> TokenMappingTable {
        TokenMappingTable::from_json(
            r#"[
                {"direction":"sol-to-evm","sourceAddress":"EPjFWdd5AufqSSqeM2qN1xzybapC8G4wEGGkZwyTDt1v",
                 "destinationAddress":"0xA0b86991c6218b36c1d19D4a2e9Eb0cE3606eB48",
                 "sourceDecimals":6,"destinationDecimals":18},
                {"direction":"evm-to-sol","sourceAddress":"0xA0B86991C6218B36C1D19D4A2E9EB0CE3606EB48",
                 "destinationAddress":"EPjFWdd5AufqSSqeM2qN1xzybapC8G4wEGGkZwyTDt1v",
                 "sourceDecimals":18,"destinationDecimals":6}
            ]"#,
        )
        .unwrap()
    }

    #[test]
    fn test_six_to_eighteen_decimals_is_exact() {
        let table = usdc_table();
        let (route, converted) = table
            .convert(
                Direction::SolToEvm,
                "EPjFWdd5AufqSSqeM2qN1xzybapC8G4wEGGkZwyTDt1v",
                100,
            )
            .unwrap();
        assert_eq!(converted.amount, 100 * 10u128.pow(12));
        assert_eq!(converted.dust, 0);
        assert_eq!(
            route.asset.token_address(),
            Some("0xA0b86991c6218b36c1d19D4a2e9Eb0cE3606eB48")
        );
    }

    #[test]
    fn test_narrowing_floors_and_never_exceeds_original() {
        for amount in [0u128, 1, 999_999_999_999, 1_000_000_000_000, 1_234_567_890_123_456_789] {
            let down = convert_amount(amount, 18, 6).unwrap();
            let back = convert_amount(down.amount, 6, 18).unwrap();
            assert!(back.amount <= amount);
            assert_eq!(back.amount + down.dust, amount);
        }
    }

    #[test]
    fn test_widening_round_trips() {
        for amount in [0u128, 1, 42, 10u128.pow(20)] {
            let up = convert_amount(amount, 9, 18).unwrap();
            let back = convert_amount(up.amount, 18, 9).unwrap();
            assert_eq!(back.amount, amount);
            assert_eq!(back.dust, 0);
        }
    }

    #[test]
    fn test_overflow_is_validation_error() {
        assert!(matches!(
            convert_amount(u128::MAX, 0, 18),
            Err(BridgeError::Validation(_))
        ));
        assert!(convert_amount(1, 0, 60).is_err());
        assert_eq!(convert_amount(5, 60, 0).unwrap().amount, 0);
    }

    #[test]
    fn test_unknown_token_is_native() {
        let table = usdc_table();
        let route = table.resolve(Direction::EvmToSol, "0x0000000000000000000000000000000000000000");
        assert_eq!(route.asset, PayoutAsset::Native);
        assert_eq!((route.source_decimals, route.destination_decimals), (18, 9));
    }

    #[test]
    fn test_evm_lookup_is_case_insensitive() {
        let table = usdc_table();
        assert!(table
            .get(Direction::EvmToSol, "0xa0b86991c6218b36c1d19d4a2e9eb0ce3606eb48")
            .is_some());
        assert!(table
            .get(Direction::SolToEvm, "epjfwdd5aufqssqem2qn1xzybapc8g4wegGkZwyTDt1v")
            .is_none());
    }

    #[test]
    fn test_duplicate_mapping_rejected() {
        let m = TokenMapping {
            direction: Direction::EvmToSol,
            source_address: "0xAA".into(),
            destination_address: "x".into(),
            source_decimals: 18,
            destination_decimals: 9,
        };
        let mut dup = m.clone();
        dup.source_address = "0xaa".into();
        assert!(TokenMappingTable::new(vec![m, dup]).is_err());
    }
}
