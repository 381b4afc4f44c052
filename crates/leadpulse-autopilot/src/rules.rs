//! Decision rules. Each one is a pure function over a [`Snapshot`]; the
//! engine runs them in registration order and keeps every proposal.

use crate::decision::{DecisionType, Proposal};
use crate::snapshot::Snapshot;

/// A named, independent rule.
#[derive(Clone, Copy)]
pub struct Rule {
    pub name: &'static str,
    pub evaluate: fn(&Snapshot) -> Vec<Proposal>,
}

impl std::fmt::Debug for Rule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Rule").field("name", &self.name).finish()
    }
}

/// Conversions below this share of target mark an underperformer.
pub const UNDERPERFORMANCE_RATIO: f64 = 0.05;
/// Agents per active campaign below which we are overloaded.
pub const OVERLOAD_RATIO: f64 = 0.5;
/// Sends required before the reply rate is trusted.
pub const MIN_SENDS_FOR_REPLY_RATE: u32 = 100;
pub const LOW_REPLY_RATE: f64 = 0.01;

pub fn default_rules() -> Vec<Rule> {
    vec![
        Rule {
            name: "orphan_company",
            evaluate: orphan_company,
        },
        Rule {
            name: "underperformer",
            evaluate: underperformer,
        },
        Rule {
            name: "idle_capacity",
            evaluate: idle_capacity,
        },
        Rule {
            name: "overload",
            evaluate: overload,
        },
        Rule {
            name: "low_reply_rate",
            evaluate: low_reply_rate,
        },
    ]
}

/// Company with no campaigns at all → create one.
pub fn orphan_company(snapshot: &Snapshot) -> Vec<Proposal> {
    snapshot
        .companies
        .iter()
        .filter(|company| snapshot.campaigns_of(&company.id).next().is_none())
        .map(|company| {
            Proposal::new(
                DecisionType::CreateCampaign,
                0.85,
                format!("Company '{}' has no campaigns", company.name),
                serde_json::json!({ "company_id": company.id }),
            )
        })
        .collect()
}

/// Active campaign converting under 5% of its target → pause.
pub fn underperformer(snapshot: &Snapshot) -> Vec<Proposal> {
    snapshot
        .active_campaigns()
        .filter(|c| c.target_conversions > 0)
        .filter(|c| {
            f64::from(c.conversions) < f64::from(c.target_conversions) * UNDERPERFORMANCE_RATIO
        })
        .map(|c| {
            Proposal::new(
                DecisionType::PauseCampaign,
                0.75,
                format!(
                    "Campaign '{}' has {} of {} target conversions",
                    c.name, c.conversions, c.target_conversions
                ),
                serde_json::json!({ "campaign_id": c.id }),
            )
        })
        .collect()
}

/// Pair idle agents with active, unassigned campaigns one to one.
/// Both sides are taken in id order so the pairing is stable.
pub fn idle_capacity(snapshot: &Snapshot) -> Vec<Proposal> {
    let mut agents: Vec<_> = snapshot.idle_agents().collect();
    agents.sort_by(|a, b| a.id.cmp(&b.id));
    let mut campaigns: Vec<_> = snapshot
        .active_campaigns()
        .filter(|c| c.assigned_agent_id.is_none())
        .collect();
    campaigns.sort_by(|a, b| a.id.cmp(&b.id));

    agents
        .into_iter()
        .zip(campaigns)
        .map(|(agent, campaign)| {
            Proposal::new(
                DecisionType::AssignAgent,
                0.90,
                format!("Agent '{}' is idle and '{}' has no agent", agent.name, campaign.name),
                serde_json::json!({ "agent_id": agent.id, "campaign_id": campaign.id }),
            )
        })
        .collect()
}

/// Fewer than one agent per two active campaigns → scale up.
pub fn overload(snapshot: &Snapshot) -> Vec<Proposal> {
    let active = snapshot.active_campaigns().count();
    if active == 0 {
        return Vec::new();
    }
    let ratio = snapshot.agents.len() as f64 / active as f64;
    if ratio >= OVERLOAD_RATIO {
        return Vec::new();
    }
    vec![Proposal::new(
        DecisionType::ScaleResources,
        0.70,
        format!(
            "{} agents for {} active campaigns (ratio {:.2})",
            snapshot.agents.len(),
            active,
            ratio
        ),
        serde_json::json!({
            "agents": snapshot.agents.len(),
            "active_campaigns": active,
            "needed": ((active as f64 * OVERLOAD_RATIO).ceil() as usize)
                .saturating_sub(snapshot.agents.len()),
        }),
    )]
}

/// Plenty of sends and almost no replies → rework the messaging.
pub fn low_reply_rate(snapshot: &Snapshot) -> Vec<Proposal> {
    snapshot
        .active_campaigns()
        .filter(|c| c.sent >= MIN_SENDS_FOR_REPLY_RATE)
        .filter_map(|c| c.reply_rate().map(|rate| (c, rate)))
        .filter(|(_, rate)| *rate < LOW_REPLY_RATE)
        .map(|(c, rate)| {
            Proposal::new(
                DecisionType::OptimizeStrategy,
                0.65,
                format!(
                    "Campaign '{}' reply rate {:.2}% over {} sends",
                    c.name,
                    rate * 100.0,
                    c.sent
                ),
                serde_json::json!({ "campaign_id": c.id, "reply_rate": rate }),
            )
        })
        .collect()
}
