// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use chrono::NaiveDateTime;
use diesel::{Insertable, Queryable, Selectable};
use strum_macros::{AsRefStr, Display, EnumIter, EnumString};

use crate::schema::tokens;

/// Asset category a token issuance belongs to. Stored as `template_id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, AsRefStr, EnumIter)]
#[strum(serialize_all = "snake_case")]
pub enum TemplateKind {
    Bond,
    Share,
    Membership,
    Coupon,
}

impl TemplateKind {
    pub fn template_id(self) -> i32 {
        match self {
            TemplateKind::Bond => 1,
            TemplateKind::Share => 2,
            TemplateKind::Membership => 3,
            TemplateKind::Coupon => 4,
        }
    }
}

impl TryFrom<i32> for TemplateKind {
    type Error = i32;

    fn try_from(template_id: i32) -> Result<Self, Self::Error> {
        match template_id {
            1 => Ok(TemplateKind::Bond),
            2 => Ok(TemplateKind::Share),
            3 => Ok(TemplateKind::Membership),
            4 => Ok(TemplateKind::Coupon),
            other => Err(other),
        }
    }
}

/// Values of the `status` column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, AsRefStr, EnumIter)]
#[strum(serialize_all = "snake_case")]
pub enum IssuanceStatus {
    Pending,
    Resolved,
    Failed,
}

#[derive(Queryable, Selectable, Debug, Clone, PartialEq, Eq)]
#[diesel(table_name = tokens, check_for_backend(diesel::pg::Pg))]
pub struct PendingIssuance {
    pub id: i32,
    #[diesel(column_name = template_id)]
    pub template_id: i32,
    #[diesel(column_name = tx_hash)]
    pub transaction_hash: String,
    #[diesel(column_name = admin_address)]
    pub deployer_address: Option<String>,
    #[diesel(column_name = token_address)]
    pub contract_address: Option<String>,
    #[diesel(column_name = abi)]
    pub contract_abi: String,
    #[diesel(column_name = bytecode)]
    pub contract_bytecode: String,
    #[diesel(column_name = created)]
    pub created_at: NaiveDateTime,
    pub status: String,
    pub no_contract_observations: i32,
    pub failure_reason: Option<String>,
}

impl PendingIssuance {
    pub fn template_kind(&self) -> Option<TemplateKind> {
        TemplateKind::try_from(self.template_id).ok()
    }

    /// Parsed `status`. Unknown values read as `Pending` so the row stays visible.
    pub fn status(&self) -> IssuanceStatus {
        self.status.parse().unwrap_or(IssuanceStatus::Pending)
    }

    pub fn is_resolved(&self) -> bool {
        self.contract_address.is_some()
    }
}

/// Row written by the issuance request producer right after broadcasting a
/// deploy transaction. Address fields stay null until reconciliation.
#[derive(Insertable, Debug, Clone, PartialEq, Eq)]
#[diesel(table_name = tokens)]
pub struct NewPendingIssuance {
    #[diesel(column_name = template_id)]
    pub template_id: i32,
    #[diesel(column_name = tx_hash)]
    pub transaction_hash: String,
    #[diesel(column_name = abi)]
    pub contract_abi: String,
    #[diesel(column_name = bytecode)]
    pub contract_bytecode: String,
}

impl NewPendingIssuance {
    pub fn new(
        template: TemplateKind,
        transaction_hash: impl Into<String>,
        contract_abi: impl Into<String>,
        contract_bytecode: impl Into<String>,
    ) -> Self {
        Self {
            template_id: template.template_id(),
            transaction_hash: transaction_hash.into(),
            contract_abi: contract_abi.into(),
            contract_bytecode: contract_bytecode.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn test_template_id_round_trip() {
        for kind in TemplateKind::iter() {
            assert_eq!(TemplateKind::try_from(kind.template_id()), Ok(kind));
        }
        assert_eq!(TemplateKind::try_from(0), Err(0));
        assert_eq!(TemplateKind::try_from(5), Err(5));
    }

    #[test]
    fn test_template_ids_are_stable() {
        // Downstream consumers filter on these values.
        assert_eq!(TemplateKind::Bond.template_id(), 1);
        assert_eq!(TemplateKind::Share.template_id(), 2);
        assert_eq!(TemplateKind::Membership.template_id(), 3);
        assert_eq!(TemplateKind::Coupon.template_id(), 4);
    }

    #[test]
    fn test_status_strings_match_check_constraint() {
        assert_eq!(IssuanceStatus::Pending.as_ref(), "pending");
        assert_eq!(IssuanceStatus::Resolved.as_ref(), "resolved");
        assert_eq!(IssuanceStatus::Failed.as_ref(), "failed");
        assert_eq!("failed".parse::<IssuanceStatus>(), Ok(IssuanceStatus::Failed));
    }

    #[test]
    fn test_unknown_status_reads_as_pending() {
        let row = PendingIssuance {
            id: 1,
            template_id: 1,
            transaction_hash: format!("0x{}", "ab".repeat(32)),
            deployer_address: None,
            contract_address: None,
            contract_abi: "[]".to_string(),
            contract_bytecode: "0x".to_string(),
            created_at: chrono::DateTime::from_timestamp(0, 0).unwrap().naive_utc(),
            status: "archived".to_string(),
            no_contract_observations: 0,
            failure_reason: None,
        };
        assert_eq!(row.status(), IssuanceStatus::Pending);
        assert_eq!(row.template_kind(), Some(TemplateKind::Bond));
        assert!(!row.is_resolved());
    }

    #[test]
    fn test_enum_parsing_rejects_unknown_values() {
        assert_eq!(
            "archived".parse::<IssuanceStatus>(),
            Err(strum::ParseError::VariantNotFound)
        );
        assert_eq!("share".parse::<TemplateKind>(), Ok(TemplateKind::Share));
        assert!("bonds".parse::<TemplateKind>().is_err());
        assert_eq!(TemplateKind::iter().count(), 4);
        assert_eq!(IssuanceStatus::iter().count(), 3);
    }

    #[test]
    fn test_new_pending_issuance_uses_template_id() {
        let new = NewPendingIssuance::new(TemplateKind::Coupon, "0xabc", "[]", "0x00");
        assert_eq!(new.template_id, 4);
        assert_eq!(new.transaction_hash, "0xabc");
    }
}
