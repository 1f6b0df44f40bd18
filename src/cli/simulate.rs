//! Scenario replay against an in-memory guild.
//!
//! A scenario is a JSON-lines file, one step per line, tagged by `event`:
//!
//! ```text
//! {"event": "join", "user": 1, "roles": [10], "partner_roles": [20]}
//! {"event": "assign", "user": 1, "roles": [10]}
//! {"event": "revoke", "user": 1, "roles": [10]}
//! {"event": "release", "user": 1}
//! {"event": "leave", "user": 1}
//! {"event": "wait", "duration": "30s"}
//! {"event": "reconcile"}
//! {"event": "release_all"}
//! ```
//!
//! Blank lines and lines starting with `#` are skipped. Gate notifications are
//! written to stdout as JSON lines, followed by the final gate statistics.

use super::config::resolve_path;
use super::logging;
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use subgate::config::GateConfig;
use subgate::gatekeeper::{Gate, GateEvent, GateStats, Notifier, NotifyError};
use subgate::platform::{MemberView, MockPlatformClient, RoleId, UserId};
use tracing::{info, warn};

/// One scenario step
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ScenarioStep {
    /// Member joins with `roles`; `partner_roles` land during the grace delay
    Join {
        user: UserId,
        #[serde(default)]
        roles: Vec<RoleId>,
        #[serde(default)]
        partner_roles: Vec<RoleId>,
    },
    Assign {
        user: UserId,
        roles: Vec<RoleId>,
    },
    Revoke {
        user: UserId,
        roles: Vec<RoleId>,
    },
    /// Member completes verification
    Release {
        user: UserId,
    },
    Leave {
        user: UserId,
    },
    Wait {
        duration: String,
    },
    Reconcile,
    /// Operator verifies everyone still awaiting verification
    ReleaseAll,
}

pub fn parse_scenario(text: &str) -> Result<Vec<ScenarioStep>, Box<dyn std::error::Error>> {
    let mut steps = Vec::new();
    for (index, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let step = serde_json::from_str(line)
            .map_err(|e| format!("scenario line {}: {}", index + 1, e))?;
        steps.push(step);
    }
    Ok(steps)
}

/// Writes each notification to stdout as one JSON line
struct JsonLinesNotifier;

#[async_trait]
impl Notifier for JsonLinesNotifier {
    async fn notify(&self, event: &GateEvent) -> Result<(), NotifyError> {
        let line =
            serde_json::to_string(event).map_err(|e| NotifyError::Unavailable(e.to_string()))?;
        println!("{}", line);
        Ok(())
    }
}

pub async fn execute(
    scenario: String,
    config_path: Option<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = GateConfig::load(&resolve_path(config_path))?;
    logging::init(&config.logging)?;

    let text = std::fs::read_to_string(&scenario)
        .map_err(|e| format!("failed to read scenario {}: {}", scenario, e))?;
    let steps = parse_scenario(&text)?;

    let stats = replay(&config, &steps, Arc::new(JsonLinesNotifier)).await?;
    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}

/// Run every step in order against a fresh in-memory guild.
///
/// Per-step gate errors are logged and the replay continues.
pub async fn replay(
    config: &GateConfig,
    steps: &[ScenarioStep],
    notifier: Arc<dyn Notifier>,
) -> Result<GateStats, Box<dyn std::error::Error>> {
    let entitlements = config.roles.entitlements(config.guild.id)?;

    let platform = MockPlatformClient::new(config.guild.id);
    platform.create_role(entitlements.paid, "paid");
    platform.create_role(entitlements.free, "free");
    for role in &config.roles.bypass {
        platform.create_role(*role, "bypass");
    }

    let gate = Gate::from_config(config, platform.clone()).with_notifier(notifier);

    for (index, step) in steps.iter().enumerate() {
        let step_no = index + 1;
        match step {
            ScenarioStep::Join {
                user,
                roles,
                partner_roles,
            } => {
                let member = platform.add_member(*user, roles.iter().copied());
                if !partner_roles.is_empty() {
                    platform.defer_assignment(*user, partner_roles.iter().copied());
                }
                match gate.on_join(&member).await {
                    Ok(outcome) => info!(step = step_no, user = %user, "join: {:?}", outcome),
                    Err(e) => warn!(step = step_no, user = %user, "join failed: {}", e),
                }
            }
            ScenarioStep::Assign { user, roles } => {
                let change = platform.assign_roles(*user, roles.iter().copied());
                role_change(&gate, step_no, *user, change).await;
            }
            ScenarioStep::Revoke { user, roles } => {
                let change = platform.revoke_roles(*user, roles.iter().copied());
                role_change(&gate, step_no, *user, change).await;
            }
            ScenarioStep::Release { user } => match gate.release(*user).await {
                Ok(outcome) => info!(step = step_no, user = %user, "release: {:?}", outcome),
                Err(e) => warn!(step = step_no, user = %user, "{}", e.operator_message()),
            },
            ScenarioStep::Leave { user } => {
                platform.remove_member(*user);
                let class = gate.on_departure(*user).await;
                info!(step = step_no, user = %user, "leave: {}", class.label());
            }
            ScenarioStep::Wait { duration } => {
                let duration = humantime::parse_duration(duration)
                    .map_err(|e| format!("step {}: invalid duration: {}", step_no, e))?;
                tokio::time::sleep(duration).await;
            }
            ScenarioStep::Reconcile => {
                let report = gate.reconcile().await;
                info!(step = step_no, "reconcile: {:?}", report);
            }
            ScenarioStep::ReleaseAll => {
                let report = gate.release_all().await;
                let json = serde_json::to_string(&report)?;
                info!(
                    step = step_no,
                    report = %json,
                    "release_all: {} users",
                    report.entries.len()
                );
            }
        }
    }

    Ok(gate.stats())
}

async fn role_change(
    gate: &Gate<MockPlatformClient>,
    step: usize,
    user: UserId,
    change: Option<(MemberView, MemberView)>,
) {
    let Some((before, after)) = change else {
        warn!(step, user = %user, "role change for unknown member skipped");
        return;
    };
    match gate.on_role_change(&before, &after).await {
        Ok(outcome) => info!(step, user = %user, "role change: {:?}", outcome),
        Err(e) => warn!(step, user = %user, "role change failed: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use subgate::gatekeeper::{EventKind, MemoryNotifier};
    use subgate::platform::GuildId;

    const PAID: RoleId = RoleId(10);
    const FREE: RoleId = RoleId(20);

    fn config() -> GateConfig {
        let mut config = GateConfig::new(GuildId(1));
        config.roles.paid = Some(PAID);
        config.roles.free = Some(FREE);
        config
    }

    #[test]
    fn test_parse_scenario_skips_comments() {
        let text = r#"
# a subscriber joins and verifies
{"event": "join", "user": 1, "roles": [10]}

{"event": "release", "user": 1}
{"event": "wait", "duration": "5s"}
{"event": "reconcile"}
"#;
        let steps = parse_scenario(text).unwrap();
        assert_eq!(steps.len(), 4);
        assert_eq!(
            steps[0],
            ScenarioStep::Join {
                user: UserId(1),
                roles: vec![PAID],
                partner_roles: vec![],
            }
        );
        assert_eq!(steps[3], ScenarioStep::Reconcile);
    }

    #[test]
    fn test_parse_scenario_reports_line() {
        let err = parse_scenario("{\"event\": \"join\", \"user\": 1}\n{\"event\": \"dance\"}")
            .unwrap_err();
        assert!(err.to_string().contains("line 2"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_replay_subscriber_flow() {
        let steps = parse_scenario(
            r#"{"event": "join", "user": 1, "roles": [10]}
{"event": "assign", "user": 1, "roles": [10]}
{"event": "release", "user": 1}
{"event": "release", "user": 1}"#,
        )
        .unwrap();
        let notifier = MemoryNotifier::new();

        let stats = replay(&config(), &steps, Arc::new(notifier.clone()))
            .await
            .unwrap();

        assert_eq!(stats.ledger.verified_total, 1);
        assert_eq!(stats.ledger.pending, 0);
        let kinds: Vec<&str> = notifier
            .events()
            .iter()
            .map(|event| event.title())
            .collect();
        assert_eq!(
            kinds,
            vec!["Subscriber Joined", "Role Re-Removal", "Verification Completed"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_replay_departure_during_hold() {
        let steps = parse_scenario(
            r#"{"event": "join", "user": 2}
{"event": "leave", "user": 2}
{"event": "release", "user": 2}"#,
        )
        .unwrap();
        let notifier = MemoryNotifier::new();

        let stats = replay(&config(), &steps, Arc::new(notifier.clone()))
            .await
            .unwrap();

        assert_eq!(stats.ledger.pending, 0);
        assert_eq!(stats.ledger.verified_total, 0);
        assert_eq!(
            notifier.count_for(UserId(2), |kind| matches!(kind, EventKind::Departed { .. })),
            1
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_replay_release_all_verifies_everyone() {
        let steps = parse_scenario(
            r#"{"event": "join", "user": 1, "roles": [10]}
{"event": "join", "user": 2}
{"event": "release_all"}"#,
        )
        .unwrap();
        let notifier = MemoryNotifier::new();

        let stats = replay(&config(), &steps, Arc::new(notifier.clone()))
            .await
            .unwrap();

        assert_eq!(stats.ledger.pending, 0);
        assert_eq!(stats.ledger.verified_total, 2);
        assert_eq!(
            notifier.count_for(UserId(2), |kind| matches!(
                kind,
                EventKind::ReleaseCompleted { .. }
            )),
            1
        );
    }

    #[tokio::test]
    async fn test_replay_requires_configured_roles() {
        let config = GateConfig::new(GuildId(1));
        let result = replay(&config, &[], Arc::new(MemoryNotifier::new())).await;
        assert!(result.is_err());
    }
}
