//! Read-only mirrors of campaigns, ad sets, ads and their metrics.
//!
//! These are cache payloads, never owned state: every read goes through
//! [`Gateway::cached_get`] and every change through [`Gateway::mutate`].

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{json, Value};

use crate::errors::{Result, SyncError};
use crate::gateway::Gateway;

const CAMPAIGN_FIELDS: &str =
    "id,name,status,effective_status,objective,daily_budget,lifetime_budget";
const AD_SET_FIELDS: &str =
    "id,name,campaign_id,status,effective_status,daily_budget,lifetime_budget,optimization_goal";
const AD_FIELDS: &str = "id,name,adset_id,status,effective_status,creative{id}";
const INSIGHT_FIELDS: &str = "spend,impressions,clicks,reach,ctr,cpc,cpm,actions";
const PAGE_LIMIT: &str = "200";

/// Action types that each approximate a purchase. They overlap (pixel and
/// omni counts include each other), so summing would double count.
const PURCHASE_ACTIONS: &[&str] = &[
    "purchase",
    "omni_purchase",
    "offsite_conversion.fb_pixel_purchase",
    "onsite_web_purchase",
];

const LEAD_ACTIONS: &[&str] = &[
    "lead",
    "offsite_conversion.fb_pixel_lead",
    "onsite_conversion.lead_grouped",
    "leadgen_grouped",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntityStatus {
    Active,
    Paused,
    Archived,
    Deleted,
}

impl EntityStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityStatus::Active => "ACTIVE",
            EntityStatus::Paused => "PAUSED",
            EntityStatus::Archived => "ARCHIVED",
            EntityStatus::Deleted => "DELETED",
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Campaign {
    pub id: String,
    pub name: String,
    pub status: String,
    #[serde(default)]
    pub effective_status: Option<String>,
    #[serde(default)]
    pub objective: Option<String>,
    /// Minor currency units.
    #[serde(default, deserialize_with = "de_opt_u64")]
    pub daily_budget: Option<u64>,
    #[serde(default, deserialize_with = "de_opt_u64")]
    pub lifetime_budget: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AdSet {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub campaign_id: Option<String>,
    pub status: String,
    #[serde(default)]
    pub effective_status: Option<String>,
    #[serde(default, deserialize_with = "de_opt_u64")]
    pub daily_budget: Option<u64>,
    #[serde(default, deserialize_with = "de_opt_u64")]
    pub lifetime_budget: Option<u64>,
    #[serde(default)]
    pub optimization_goal: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Ad {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub adset_id: Option<String>,
    pub status: String,
    #[serde(default)]
    pub effective_status: Option<String>,
    #[serde(default)]
    pub creative: Option<CreativeRef>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CreativeRef {
    pub id: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ActionCount {
    pub action_type: String,
    #[serde(deserialize_with = "de_f64")]
    pub value: f64,
}

/// Rolled-up delivery metrics for one object over one date range.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Metrics {
    #[serde(default, deserialize_with = "de_f64")]
    pub spend: f64,
    #[serde(default, deserialize_with = "de_f64")]
    pub impressions: f64,
    #[serde(default, deserialize_with = "de_f64")]
    pub clicks: f64,
    #[serde(default, deserialize_with = "de_f64")]
    pub reach: f64,
    #[serde(default, deserialize_with = "de_f64")]
    pub ctr: f64,
    #[serde(default, deserialize_with = "de_f64")]
    pub cpc: f64,
    #[serde(default, deserialize_with = "de_f64")]
    pub cpm: f64,
    #[serde(default)]
    pub actions: Vec<ActionCount>,
}

impl Metrics {
    /// Upper-bound estimate of purchases across the overlapping action types.
    ///
    /// This is an approximation and can disagree with Ads Manager, which
    /// picks one attribution source per account.
    pub fn purchases(&self) -> f64 {
        self.max_of(PURCHASE_ACTIONS)
    }

    /// Upper-bound estimate of leads; same caveat as [`purchases`](Self::purchases).
    pub fn leads(&self) -> f64 {
        self.max_of(LEAD_ACTIONS)
    }

    fn max_of(&self, kinds: &[&str]) -> f64 {
        self.actions
            .iter()
            .filter(|a| kinds.contains(&a.action_type.as_str()))
            .map(|a| a.value)
            .fold(0.0, f64::max)
    }
}

/// Reporting window for insights. Part of the cache key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DateRange {
    /// A Graph preset such as `last_7d` or `this_month`.
    Preset(String),
    /// Inclusive `YYYY-MM-DD` bounds.
    Custom { since: String, until: String },
}

impl DateRange {
    fn to_param(&self) -> (&'static str, String) {
        match self {
            DateRange::Preset(p) => ("date_preset", p.clone()),
            DateRange::Custom { since, until } => (
                "time_range",
                json!({ "since": since, "until": until }).to_string(),
            ),
        }
    }
}

impl Default for DateRange {
    fn default() -> Self {
        DateRange::Preset("last_7d".to_string())
    }
}

/// Ad account ids are addressed as `act_<id>`; accept either form.
pub fn account_path(account_id: &str) -> String {
    if account_id.starts_with("act_") {
        account_id.to_string()
    } else {
        format!("act_{account_id}")
    }
}

impl Gateway {
    pub async fn campaigns(&self, account_id: &str) -> Result<Vec<Campaign>> {
        let path = format!("/{}/campaigns", account_path(account_id));
        self.list(&path, CAMPAIGN_FIELDS).await
    }

    pub async fn ad_sets(&self, campaign_id: &str) -> Result<Vec<AdSet>> {
        self.list(&format!("/{campaign_id}/adsets"), AD_SET_FIELDS)
            .await
    }

    pub async fn ads(&self, ad_set_id: &str) -> Result<Vec<Ad>> {
        self.list(&format!("/{ad_set_id}/ads"), AD_FIELDS).await
    }

    /// Metrics for any campaign, ad set or ad. An object with no delivery in
    /// the range yields zeroed metrics.
    pub async fn insights(&self, object_id: &str, range: &DateRange) -> Result<Metrics> {
        let params = [("fields", INSIGHT_FIELDS.to_string()), range.to_param()];
        let value = self
            .cached_get(&format!("/{object_id}/insights"), &params)
            .await?;

        match value.get("data").and_then(|d| d.get(0)) {
            Some(row) => Ok(serde_json::from_value(row.clone())?),
            None => Ok(Metrics::default()),
        }
    }

    pub async fn set_status(&self, object_id: &str, status: EntityStatus) -> Result<bool> {
        self.mutate(object_id, &[("status", status.as_str().to_string())])
            .await
    }

    /// Set a daily budget in minor currency units (cents).
    pub async fn set_daily_budget(&self, object_id: &str, amount: u64) -> Result<bool> {
        self.mutate(object_id, &[("daily_budget", amount.to_string())])
            .await
    }

    pub async fn rename(&self, object_id: &str, name: &str) -> Result<bool> {
        self.mutate(object_id, &[("name", name.to_string())]).await
    }

    async fn list<T: serde::de::DeserializeOwned>(&self, path: &str, fields: &str) -> Result<Vec<T>> {
        let params = [
            ("fields", fields.to_string()),
            ("limit", PAGE_LIMIT.to_string()),
        ];
        let value = self.cached_get(path, &params).await?;
        let data = value
            .get("data")
            .cloned()
            .ok_or_else(|| SyncError::Protocol {
                message: format!("{path}: response has no data array"),
            })?;
        Ok(serde_json::from_value(data)?)
    }
}

/// Graph encodes most numbers as strings.
fn de_f64<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<f64, D::Error> {
    match Value::deserialize(d)? {
        Value::Number(n) => Ok(n.as_f64().unwrap_or(0.0)),
        Value::String(s) => s.parse().map_err(serde::de::Error::custom),
        Value::Null => Ok(0.0),
        other => Err(serde::de::Error::custom(format!("expected number, got {other}"))),
    }
}

fn de_opt_u64<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<Option<u64>, D::Error> {
    match Value::deserialize(d)? {
        Value::Number(n) => Ok(n.as_u64()),
        Value::String(s) if s.is_empty() => Ok(None),
        Value::String(s) => s.parse().map(Some).map_err(serde::de::Error::custom),
        Value::Null => Ok(None),
        other => Err(serde::de::Error::custom(format!("expected integer, got {other}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn purchases_take_maximum_not_sum() {
        let metrics: Metrics = serde_json::from_value(json!({
            "spend": "120.50",
            "impressions": "10000",
            "actions": [
                {"action_type": "purchase", "value": "12"},
                {"action_type": "offsite_conversion.fb_pixel_purchase", "value": "14"},
                {"action_type": "omni_purchase", "value": "13"},
                {"action_type": "lead", "value": "3"},
                {"action_type": "link_click", "value": "400"}
            ]
        }))
        .unwrap();

        assert_eq!(metrics.spend, 120.5);
        assert_eq!(metrics.purchases(), 14.0);
        assert_eq!(metrics.leads(), 3.0);
    }

    #[test]
    fn missing_actions_yield_zero() {
        let metrics: Metrics = serde_json::from_value(json!({"spend": "0"})).unwrap();
        assert_eq!(metrics.purchases(), 0.0);
        assert_eq!(metrics.leads(), 0.0);
    }

    #[test]
    fn budgets_parse_from_strings() {
        let c: Campaign = serde_json::from_value(json!({
            "id": "1", "name": "Spring", "status": "ACTIVE", "daily_budget": "5000"
        }))
        .unwrap();
        assert_eq!(c.daily_budget, Some(5000));
        assert_eq!(c.lifetime_budget, None);
    }

    #[test]
    fn account_ids_are_normalised() {
        assert_eq!(account_path("123"), "act_123");
        assert_eq!(account_path("act_123"), "act_123");
    }

    #[test]
    fn custom_range_is_encoded_as_json() {
        let range = DateRange::Custom {
            since: "2024-01-01".into(),
            until: "2024-01-31".into(),
        };
        let (name, value) = range.to_param();
        assert_eq!(name, "time_range");
        let parsed: Value = serde_json::from_str(&value).unwrap();
        assert_eq!(parsed["since"], "2024-01-01");
    }
}
