//! Microsoft Teams incoming-webhook sink
//!
//! Each alert becomes one message carrying a single Adaptive Card: a
//! coloured title, a fact table describing the record and a button to the
//! marketing dashboard.

use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;

use super::{AlertSink, DeliveryError};
use crate::models::{AnomalyKind, AnomalyRecord};

pub const ADAPTIVE_CARD_CONTENT_TYPE: &str = "application/vnd.microsoft.card.adaptive";

/// Substring of the template URL shipped in sample configuration
pub const PLACEHOLDER_MARKER: &str = "your-organization";

const CARD_SCHEMA: &str = "http://adaptivecards.io/schemas/adaptive-card.json";
const CARD_VERSION: &str = "1.4";

const FACT_ENTITY: &str = "Entity";
const FACT_METRIC: &str = "Metric";
const FACT_KIND: &str = "Kind";
const FACT_VALUE: &str = "Value";
const FACT_DATE: &str = "Date";
const FACT_SCORE: &str = "Score";
const FACT_METHOD: &str = "Method";

/// True when `url` is still the sample template and must not be called
pub fn is_placeholder_url(url: &str) -> bool {
    url.contains(PLACEHOLDER_MARKER)
}

/// Top-level webhook payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TeamsMessage {
    #[serde(rename = "type")]
    pub message_type: String,
    pub attachments: Vec<Attachment>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub content_type: String,
    pub content: AdaptiveCard,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdaptiveCard {
    #[serde(rename = "$schema")]
    pub schema: String,
    #[serde(rename = "type")]
    pub card_type: String,
    pub version: String,
    pub body: Vec<CardElement>,
    #[serde(default)]
    pub actions: Vec<CardAction>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum CardElement {
    TextBlock {
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        size: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        weight: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        color: Option<String>,
        #[serde(default)]
        wrap: bool,
    },
    FactSet {
        facts: Vec<Fact>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fact {
    pub title: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum CardAction {
    #[serde(rename = "Action.OpenUrl")]
    OpenUrl { title: String, url: String },
}

/// Fields recovered from a rendered message
#[derive(Debug, Clone, PartialEq)]
pub struct CardSummary {
    pub entity: String,
    pub date: NaiveDate,
    pub kind: AnomalyKind,
    pub score: f64,
}

impl TeamsMessage {
    /// Render `record` as a card linking to `dashboard_url`
    pub fn for_record(record: &AnomalyRecord, dashboard_url: &str) -> Self {
        let (emoji, color) = match record.kind {
            AnomalyKind::Drop => ("🚨", "Attention"),
            _ => ("📈", "Warning"),
        };

        let facts = [
            (FACT_ENTITY, record.entity.clone()),
            (FACT_METRIC, record.metric.clone()),
            (FACT_KIND, record.kind.to_string()),
            (FACT_VALUE, record.display_value()),
            (FACT_DATE, record.date.format("%Y-%m-%d").to_string()),
            (FACT_SCORE, record.score.to_string()),
            (FACT_METHOD, record.method.to_string()),
        ]
        .into_iter()
        .map(|(title, value)| Fact {
            title: title.to_string(),
            value,
        })
        .collect();

        let card = AdaptiveCard {
            schema: CARD_SCHEMA.to_string(),
            card_type: "AdaptiveCard".to_string(),
            version: CARD_VERSION.to_string(),
            body: vec![
                CardElement::TextBlock {
                    text: format!("{} Alert: {}", emoji, record.entity),
                    size: Some("Large".to_string()),
                    weight: Some("Bolder".to_string()),
                    color: Some(color.to_string()),
                    wrap: true,
                },
                CardElement::FactSet { facts },
            ],
            actions: vec![CardAction::OpenUrl {
                title: "Open dashboard".to_string(),
                url: dashboard_url.to_string(),
            }],
        };

        Self {
            message_type: "message".to_string(),
            attachments: vec![Attachment {
                content_type: ADAPTIVE_CARD_CONTENT_TYPE.to_string(),
                content: card,
            }],
        }
    }

    /// Recover entity, date, kind and score from the first card's facts
    pub fn summary(&self) -> Option<CardSummary> {
        let card = &self.attachments.first()?.content;
        let facts = card.body.iter().find_map(|element| match element {
            CardElement::FactSet { facts } => Some(facts),
            _ => None,
        })?;
        let fact = |title: &str| {
            facts
                .iter()
                .find(|f| f.title == title)
                .map(|f| f.value.as_str())
        };

        let kind = serde_json::from_value(serde_json::Value::String(fact(FACT_KIND)?.to_string())).ok()?;
        Some(CardSummary {
            entity: fact(FACT_ENTITY)?.to_string(),
            date: NaiveDate::parse_from_str(fact(FACT_DATE)?, "%Y-%m-%d").ok()?,
            kind,
            score: fact(FACT_SCORE)?.parse().ok()?,
        })
    }
}

/// Posts one Adaptive Card per alert to a Teams incoming webhook
#[derive(Debug, Clone)]
pub struct TeamsWebhookSink {
    client: reqwest::Client,
    endpoint: Url,
    dashboard_url: String,
}

impl TeamsWebhookSink {
    pub fn new(endpoint: &str, dashboard_url: impl Into<String>, timeout: Duration) -> Result<Self, DeliveryError> {
        let endpoint = Url::parse(endpoint)?;
        let client = reqwest::Client::builder().timeout(timeout).build()?;

        Ok(Self {
            client,
            endpoint,
            dashboard_url: dashboard_url.into(),
        })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }
}

#[async_trait]
impl AlertSink for TeamsWebhookSink {
    fn name(&self) -> &str {
        "teams"
    }

    async fn deliver(&self, record: &AnomalyRecord) -> Result<(), DeliveryError> {
        let message = TeamsMessage::for_record(record, &self.dashboard_url);

        let response = self
            .client
            .post(self.endpoint.clone())
            .json(&message)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(DeliveryError::Status {
                status: status.as_u16(),
            });
        }

        debug!(
            entity = %record.entity,
            metric = %record.metric,
            status = status.as_u16(),
            "Teams card posted"
        );
        Ok(())
    }
}
