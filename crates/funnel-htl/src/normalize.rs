//! Enum normalization — the one place model-origin enum strings are allowed
//! into the type system.
//!
//! Procedure: canonicalize (lowercase, trim, `-`/space to `_`), exact match,
//! alias table, then a longest-common-subsequence fallback accepted only
//! when the overlap is at least [`MIN_LCS`]. Anything weaker falls back to
//! the caller-supplied default. Every correction and every fallback is
//! logged so enum drift shows up in operations instead of silently mutating
//! conversations.

use tracing::{debug, warn};

use funnel_core::types::{BotAction, IntentLevel, RiskLevel, Sentiment, Stage};

/// Minimum common-subsequence length for the fuzzy fallback.
const MIN_LCS: usize = 3;

/// Fixed alias table shared by every enum. Targets must themselves be valid
/// variant strings; an alias whose target is not in the caller's variant set
/// is skipped.
const ALIASES: &[(&str, &str)] = &[
    // stages
    ("qualifying", "qualification"),
    ("qualify", "qualification"),
    ("qualified", "qualification"),
    ("price", "pricing"),
    ("price_discussion", "pricing"),
    ("call_to_action", "cta"),
    ("follow_up", "followup"),
    ("followup_6h", "followup"),
    ("follow_up_6h", "followup"),
    ("nurture", "followup"),
    ("ghost", "ghosted"),
    ("won", "closed"),
    ("closed_won", "closed"),
    ("closed_lost", "lost"),
    ("dead", "lost"),
    // actions
    ("handoff", "flag_attention"),
    ("human_handoff", "flag_attention"),
    ("escalate", "flag_attention"),
    ("flag", "flag_attention"),
    ("send", "send_now"),
    ("reply", "send_now"),
    ("respond", "send_now"),
    ("wait", "wait_schedule"),
    ("schedule", "wait_schedule"),
    ("hold", "wait_schedule"),
    ("start_cta", "initiate_cta"),
    ("cta_now", "initiate_cta"),
    // sentiments
    ("positive", "curious"),
    ("interested", "curious"),
    ("happy", "excited"),
    ("enthusiastic", "excited"),
    ("negative", "frustrated"),
    ("angry", "frustrated"),
    ("annoyed", "frustrated"),
    ("doubtful", "skeptical"),
    ("unsure", "skeptical"),
    ("hesitant", "skeptical"),
    ("ok", "neutral"),
    ("fine", "neutral"),
    // intent levels
    ("hot", "high"),
    ("strong", "high"),
    ("warm", "medium"),
    ("moderate", "medium"),
    ("cold", "low"),
    ("weak", "low"),
    ("na", "unknown"),
    ("n_a", "unknown"),
    ("unclear", "unknown"),
    // risk levels
    ("severe", "high"),
    ("minimal", "low"),
    ("safe", "low"),
];

pub fn normalize_stage(raw: &str, default: Stage) -> Stage {
    let variants: Vec<&str> = Stage::ALL.iter().map(|v| v.as_str()).collect();
    resolve(raw, "stage", &variants, default.as_str())
        .parse()
        .unwrap_or(default)
}

pub fn normalize_action(raw: &str, default: BotAction) -> BotAction {
    let variants: Vec<&str> = BotAction::ALL.iter().map(|v| v.as_str()).collect();
    resolve(raw, "action", &variants, default.as_str())
        .parse()
        .unwrap_or(default)
}

pub fn normalize_intent(raw: &str, default: IntentLevel) -> IntentLevel {
    let variants: Vec<&str> = IntentLevel::ALL.iter().map(|v| v.as_str()).collect();
    resolve(raw, "intent_level", &variants, default.as_str())
        .parse()
        .unwrap_or(default)
}

pub fn normalize_sentiment(raw: &str, default: Sentiment) -> Sentiment {
    let variants: Vec<&str> = Sentiment::ALL.iter().map(|v| v.as_str()).collect();
    resolve(raw, "user_sentiment", &variants, default.as_str())
        .parse()
        .unwrap_or(default)
}

pub fn normalize_risk(raw: &str, default: RiskLevel) -> RiskLevel {
    let variants: Vec<&str> = RiskLevel::ALL.iter().map(|v| v.as_str()).collect();
    resolve(raw, "risk", &variants, default.as_str())
        .parse()
        .unwrap_or(default)
}

/// Core resolution over variant strings. Returns one of `variants` or
/// `default`.
fn resolve<'a>(raw: &str, field: &str, variants: &[&'a str], default: &'a str) -> &'a str {
    let canon = canonicalize(raw);

    if let Some(v) = variants.iter().find(|v| **v == canon) {
        return v;
    }

    if let Some((_, target)) = ALIASES.iter().find(|(alias, _)| *alias == canon) {
        if let Some(v) = variants.iter().find(|v| *v == target) {
            debug!(field, raw, normalized = *v, "enum alias applied");
            return v;
        }
    }

    // Fuzzy fallback: pick the variant with the longest common subsequence.
    let mut best: Option<(&str, usize)> = None;
    for v in variants {
        let len = lcs_len(&canon, v);
        if best.map(|(_, b)| len > b).unwrap_or(true) {
            best = Some((v, len));
        }
    }
    if let Some((v, len)) = best {
        if len >= MIN_LCS {
            debug!(field, raw, normalized = v, lcs = len, "enum fuzzy-matched");
            return v;
        }
    }

    warn!(field, raw, default, "enum unrecognized, using default");
    default
}

fn canonicalize(raw: &str) -> String {
    raw.trim()
        .to_lowercase()
        .replace(['-', ' '], "_")
}

/// Classic longest-common-subsequence length over bytes.
fn lcs_len(a: &str, b: &str) -> usize {
    let a = a.as_bytes();
    let b = b.as_bytes();
    if a.is_empty() || b.is_empty() {
        return 0;
    }
    let mut prev = vec![0usize; b.len() + 1];
    let mut curr = vec![0usize; b.len() + 1];
    for &ca in a {
        for (j, &cb) in b.iter().enumerate() {
            curr[j + 1] = if ca == cb {
                prev[j] + 1
            } else {
                prev[j + 1].max(curr[j])
            };
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[b.len()]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_match_after_canonicalization() {
        assert_eq!(normalize_action("Send-Now", BotAction::WaitSchedule), BotAction::SendNow);
        assert_eq!(normalize_stage("  PRICING ", Stage::Greeting), Stage::Pricing);
        assert_eq!(
            normalize_action("flag attention", BotAction::WaitSchedule),
            BotAction::FlagAttention
        );
    }

    #[test]
    fn alias_table_covers_observed_drift() {
        assert_eq!(
            normalize_stage("qualifying", Stage::Greeting),
            Stage::Qualification
        );
        assert_eq!(
            normalize_action("handoff", BotAction::WaitSchedule),
            BotAction::FlagAttention
        );
        assert_eq!(
            normalize_sentiment("positive", Sentiment::Neutral),
            Sentiment::Curious
        );
    }

    #[test]
    fn shared_alias_resolves_per_enum() {
        // "hot" targets "high", which only exists for intent/risk.
        assert_eq!(normalize_intent("hot", IntentLevel::Unknown), IntentLevel::High);
        assert_eq!(normalize_risk("severe", RiskLevel::Low), RiskLevel::High);
    }

    #[test]
    fn lcs_fallback_catches_typos() {
        assert_eq!(
            normalize_stage("gretting", Stage::Qualification),
            Stage::Greeting
        );
        assert_eq!(
            normalize_action("send_nw", BotAction::WaitSchedule),
            BotAction::SendNow
        );
    }

    #[test]
    fn weak_overlap_falls_back_to_default() {
        assert_eq!(normalize_stage("xy", Stage::Followup), Stage::Followup);
        assert_eq!(normalize_risk("", RiskLevel::Low), RiskLevel::Low);
    }

    #[test]
    fn lcs_len_basics() {
        assert_eq!(lcs_len("greeting", "greeting"), 8);
        assert_eq!(lcs_len("gretting", "greeting"), 7);
        assert_eq!(lcs_len("abc", "xyz"), 0);
        assert_eq!(lcs_len("", "abc"), 0);
    }
}
