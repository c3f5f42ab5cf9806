//! Requestability rule engine.
//!
//! An administrator configures an ordered list of rules per container; the
//! engine evaluates a vial against that list to decide whether it may be
//! pooled into a request. Each rule either marks the vial available, marks it
//! unavailable with a human-readable reason, or abstains. The first rule that
//! does not abstain determines the verdict; when every rule abstains, the
//! vial's raw `available` flag from the specimen feed is the verdict.
//!
//! A misconfigured rule (a custom rule referencing a column that no longer
//! exists) is surfaced as [`RequestError::InvalidRule`] and aborts the entire
//! enclosing mutation. Misconfiguration must be visible, never silently
//! treated as "unavailable".
//!
//! Rule lists are replaced wholesale; there is no incremental edit. A strict
//! YAML wire model ([`RuleSet`]) round-trips rule configuration for study
//! settings import/export.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{RequestError, RequestResult};
use crate::model::ContainerId;
use crate::specimens::Vial;
use crate::store::StudyStore;

/// One configured requestability rule.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RequestableRule {
    /// Verdict from the tri-state `Requestable` override column in the
    /// specimen data feed; abstains when the column is null.
    AdminOverride,
    /// Marks vials unavailable if they are not currently held by a
    /// repository.
    AtRepository,
    /// Marks vials unavailable if they are part of an active specimen
    /// request.
    LockedInRequest,
    /// Marks vials unavailable if they are being processed: claimed by an
    /// active request whose status locks its vial set.
    LockedWhileProcessing,
    /// Administrator-defined predicate over a vial attribute column.
    CustomQuery(CustomQueryRule),
}

/// Configuration of a [`RequestableRule::CustomQuery`] rule.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CustomQueryRule {
    /// Vial column the predicate reads. Must exist in the specimen
    /// repository's schema or the rule is invalid.
    pub column: String,
    /// Value the column must equal for the rule to fire.
    pub matches: String,
    /// Whether a matching vial is marked available or unavailable.
    pub mark_available: bool,
}

impl RequestableRule {
    /// Display name, matching the administrator-facing rule list.
    pub fn name(&self) -> String {
        match self {
            RequestableRule::AdminOverride => "Administrator Override".to_owned(),
            RequestableRule::AtRepository => "At Repository Check".to_owned(),
            RequestableRule::LockedInRequest => "Locked In Request Check".to_owned(),
            RequestableRule::LockedWhileProcessing => "Locked While Processing Check".to_owned(),
            RequestableRule::CustomQuery(rule) => format!("Custom Query: {}", rule.column),
        }
    }
}

/// What a single rule says about a single vial.
#[derive(Clone, Debug, PartialEq, Eq)]
enum RuleOpinion {
    Available,
    Unavailable(String),
    Abstain,
}

/// The engine's final availability verdict for a vial.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Verdict {
    pub requestable: bool,
    /// Human-readable reason, present when the vial is not requestable.
    pub reason: Option<String>,
}

impl Verdict {
    fn available() -> Self {
        Verdict {
            requestable: true,
            reason: None,
        }
    }

    fn unavailable(reason: String) -> Self {
        Verdict {
            requestable: false,
            reason: Some(reason),
        }
    }
}

/// Snapshot of the cross-request state some rules consult. Built by the
/// caller inside the same transaction that uses the verdicts.
#[derive(Clone, Debug, Default)]
pub struct RuleContext {
    /// Global unique ids of vials claimed by a non-final request.
    pub locked_in_request: BTreeSet<String>,
    /// Global unique ids of vials claimed by a non-final request whose
    /// status locks its vial set.
    pub processing: BTreeSet<String>,
    /// Column names the specimen repository exposes.
    pub columns: BTreeSet<String>,
}

fn classify(rule: &RequestableRule, vial: &Vial, ctx: &RuleContext) -> RequestResult<RuleOpinion> {
    let opinion = match rule {
        RequestableRule::AdminOverride => match vial.requestable {
            Some(true) => RuleOpinion::Available,
            Some(false) => RuleOpinion::Unavailable(
                "This vial's availability status was set by an administrator. \
                 Please contact an administrator for more information."
                    .to_owned(),
            ),
            None => RuleOpinion::Abstain,
        },
        RequestableRule::AtRepository => {
            if vial.at_repository {
                RuleOpinion::Abstain
            } else {
                RuleOpinion::Unavailable(
                    "This vial is unavailable because it is not currently held by a repository."
                        .to_owned(),
                )
            }
        }
        RequestableRule::LockedInRequest => {
            if ctx.locked_in_request.contains(&vial.global_unique_id) {
                RuleOpinion::Unavailable(
                    "This vial is unavailable because it is locked in a specimen request."
                        .to_owned(),
                )
            } else {
                RuleOpinion::Abstain
            }
        }
        RequestableRule::LockedWhileProcessing => {
            if ctx.processing.contains(&vial.global_unique_id) {
                RuleOpinion::Unavailable(
                    "This vial is unavailable because it is being processed.".to_owned(),
                )
            } else {
                RuleOpinion::Abstain
            }
        }
        RequestableRule::CustomQuery(custom) => {
            if !ctx.columns.contains(&custom.column) {
                return Err(RequestError::InvalidRule {
                    message: format!(
                        "custom rule references column '{}', which does not exist \
                         in the specimen repository",
                        custom.column
                    ),
                });
            }
            match vial.attributes.get(&custom.column) {
                Some(value) if *value == custom.matches => {
                    if custom.mark_available {
                        RuleOpinion::Available
                    } else {
                        RuleOpinion::Unavailable(format!(
                            "This vial is unavailable because its column \"{}\" \
                             matched the value \"{}\".",
                            custom.column, custom.matches
                        ))
                    }
                }
                _ => RuleOpinion::Abstain,
            }
        }
    };
    Ok(opinion)
}

/// Evaluates a vial against an ordered rule list.
///
/// Rules are consulted in stored order and the first non-abstaining rule
/// determines the verdict; no rule composition or voting happens. If every
/// rule abstains, the vial's raw `available` flag is the verdict. Evaluation
/// is deterministic and side-effect-free.
///
/// # Errors
///
/// Returns [`RequestError::InvalidRule`] if a rule is misconfigured; callers
/// must abort their entire enclosing mutation in that case.
pub fn evaluate(vial: &Vial, rules: &[RequestableRule], ctx: &RuleContext) -> RequestResult<Verdict> {
    for rule in rules {
        match classify(rule, vial, ctx)? {
            RuleOpinion::Available => return Ok(Verdict::available()),
            RuleOpinion::Unavailable(reason) => return Ok(Verdict::unavailable(reason)),
            RuleOpinion::Abstain => {}
        }
    }

    if vial.available {
        Ok(Verdict::available())
    } else {
        Ok(Verdict::unavailable("This vial is not available.".to_owned()))
    }
}

/// Builds the caller-facing rejection message for an unavailable vial:
/// `Specimen <id> is unavailable because ...`.
pub fn unavailable_message(vial: &Vial, reason: Option<&str>) -> String {
    match reason {
        Some(reason) => format!(
            "Specimen {}{}",
            vial.global_unique_id,
            reason.replacen("This vial", "", 1)
        ),
        None => format!("Specimen {} is not available.", vial.global_unique_id),
    }
}

/// The rule list a freshly configured study starts with.
pub fn default_rules() -> Vec<RequestableRule> {
    vec![
        RequestableRule::AtRepository,
        RequestableRule::AdminOverride,
        RequestableRule::LockedInRequest,
    ]
}

/// Per-container rule configuration.
///
/// The stored order is the evaluation order. Saving replaces the whole list
/// atomically, which avoids partial-update races with concurrent evaluation.
pub struct RuleRegistry {
    store: Arc<StudyStore>,
    container: ContainerId,
}

impl RuleRegistry {
    pub fn new(store: Arc<StudyStore>, container: ContainerId) -> Self {
        Self { store, container }
    }

    /// The configured rules in evaluation order; empty when never configured.
    pub fn rules(&self) -> Vec<RequestableRule> {
        self.store
            .read()
            .rules
            .get(&self.container)
            .cloned()
            .unwrap_or_default()
    }

    /// Replaces the whole rule list.
    pub fn save_rules(&self, rules: Vec<RequestableRule>) {
        tracing::info!(
            container = self.container.0,
            count = rules.len(),
            "replacing requestability rules"
        );
        self.store.write().rules.insert(self.container, rules);
    }

    /// Resets the container to the default rule set.
    pub fn set_default_rules(&self) {
        self.save_rules(default_rules());
    }
}

// ============================================================================
// Wire model
// ============================================================================

#[derive(Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct RuleSetWire {
    rules: Vec<RuleWire>,
}

#[derive(Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct RuleWire {
    #[serde(rename = "type")]
    rule_type: RuleTypeWire,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    data: Option<CustomQueryRule>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum RuleTypeWire {
    AdminOverride,
    AtRepository,
    LockedInRequest,
    LockedWhileProcessing,
    CustomQuery,
}

/// Rule-set configuration document operations.
///
/// Zero-sized namespacing type; all methods are associated functions.
pub struct RuleSet;

impl RuleSet {
    /// Parse an ordered rule list from YAML text.
    ///
    /// Uses `serde_path_to_error` to surface a best-effort path (e.g.
    /// `rules[1].data.column`) to the failing field when the YAML does not
    /// match the wire schema. Unknown keys are rejected.
    ///
    /// # Errors
    ///
    /// Returns [`RequestError::Validation`] if the YAML does not represent a
    /// valid rule list, or if a `custom_query` entry is missing its `data`
    /// block (or a non-custom entry carries one).
    pub fn parse(yaml_text: &str) -> RequestResult<Vec<RequestableRule>> {
        let deserializer = serde_yaml::Deserializer::from_str(yaml_text);
        let wire = match serde_path_to_error::deserialize::<_, RuleSetWire>(deserializer) {
            Ok(parsed) => parsed,
            Err(err) => {
                let path = err.path().to_string();
                let source = err.into_inner();
                let path = if path.is_empty() { "<root>" } else { path.as_str() };
                return Err(RequestError::Validation(format!(
                    "Rule configuration schema mismatch at {path}: {source}"
                )));
            }
        };

        let mut rules = Vec::with_capacity(wire.rules.len());
        for (index, entry) in wire.rules.into_iter().enumerate() {
            let rule = match (entry.rule_type, entry.data) {
                (RuleTypeWire::AdminOverride, None) => RequestableRule::AdminOverride,
                (RuleTypeWire::AtRepository, None) => RequestableRule::AtRepository,
                (RuleTypeWire::LockedInRequest, None) => RequestableRule::LockedInRequest,
                (RuleTypeWire::LockedWhileProcessing, None) => {
                    RequestableRule::LockedWhileProcessing
                }
                (RuleTypeWire::CustomQuery, Some(data)) => RequestableRule::CustomQuery(data),
                (RuleTypeWire::CustomQuery, None) => {
                    return Err(RequestError::Validation(format!(
                        "Rule {index}: custom_query rules require a data block"
                    )));
                }
                (other, Some(_)) => {
                    return Err(RequestError::Validation(format!(
                        "Rule {index}: {other:?} rules do not take a data block"
                    )));
                }
            };
            rules.push(rule);
        }
        Ok(rules)
    }

    /// Render an ordered rule list as YAML text.
    ///
    /// # Errors
    ///
    /// Returns [`RequestError::Validation`] if serialization fails.
    pub fn render(rules: &[RequestableRule]) -> RequestResult<String> {
        let wire = RuleSetWire {
            rules: rules
                .iter()
                .map(|rule| match rule {
                    RequestableRule::AdminOverride => RuleWire {
                        rule_type: RuleTypeWire::AdminOverride,
                        data: None,
                    },
                    RequestableRule::AtRepository => RuleWire {
                        rule_type: RuleTypeWire::AtRepository,
                        data: None,
                    },
                    RequestableRule::LockedInRequest => RuleWire {
                        rule_type: RuleTypeWire::LockedInRequest,
                        data: None,
                    },
                    RequestableRule::LockedWhileProcessing => RuleWire {
                        rule_type: RuleTypeWire::LockedWhileProcessing,
                        data: None,
                    },
                    RequestableRule::CustomQuery(data) => RuleWire {
                        rule_type: RuleTypeWire::CustomQuery,
                        data: Some(data.clone()),
                    },
                })
                .collect(),
        };
        serde_yaml::to_string(&wire)
            .map_err(|err| RequestError::Validation(format!("failed to render rule set: {err}")))
    }
}
