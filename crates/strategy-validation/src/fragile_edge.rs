use crate::stats;
use crate::types::FragileEdgePolicy;

/// Advisory action over a statistically fragile edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FragileAction {
    Keep,
    Downweight,
    Drop,
}

impl FragileAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            FragileAction::Keep => "Keep",
            FragileAction::Downweight => "Downweight",
            FragileAction::Drop => "Drop",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FragileDecision {
    pub action: FragileAction,
    /// 1.0 for keep, 0.5 for downweight, 0.0 for drop.
    pub weight_multiplier: f64,
    pub rationale: String,
}

/// Lower-tail quantile and expected shortfall at `alpha` over the raw
/// per-period returns.
pub fn compute_tail_metrics(returns: &[f64], alpha: f64) -> (f64, f64) {
    stats::quantile_and_expected_shortfall(returns, alpha)
}

fn is_near_hurdle(lb_ann_gm: f64, hurdle_ann: f64, near_abs: f64, near_rel: f64) -> bool {
    let gap = (lb_ann_gm - hurdle_ann).abs();
    let within_abs = gap <= near_abs;
    let within_rel = hurdle_ann > 0.0 && gap / hurdle_ann <= near_rel;
    within_abs || within_rel
}

/// A downside tail point is severe when its depth exceeds
/// `tail_multiple` times the (positive) per-period edge.
fn is_severe_tail(tail_point: f64, edge_per_gm: f64, tail_multiple: f64) -> bool {
    edge_per_gm > 0.0 && tail_point < 0.0 && tail_point.abs() > tail_multiple * edge_per_gm
}

/// The Keep / Downweight / Drop advisory tree.
///
/// Drop when severe tails or extreme L-variability coincide with a
/// near-hurdle bound; downweight on any single soft risk flag (severe
/// tails, elevated L-variability, small sample); keep otherwise.
pub fn analyze_fragile_edge(
    lb_per_gm: f64,
    lb_ann_gm: f64,
    hurdle_ann: f64,
    rel_var_l: f64,
    q05: f64,
    es05: f64,
    n: usize,
    policy: &FragileEdgePolicy,
) -> FragileDecision {
    let near_hurdle = is_near_hurdle(lb_ann_gm, hurdle_ann, policy.near_abs, policy.near_rel);
    let severe_tail_q = is_severe_tail(q05, lb_per_gm, policy.tail_multiple);
    let severe_tail_es = is_severe_tail(es05, lb_per_gm, policy.tail_multiple);
    let severe_tail = severe_tail_q || severe_tail_es;

    if severe_tail && near_hurdle {
        let which = if severe_tail_es { "ES05 and/or Q05" } else { "Q05" };
        return FragileDecision {
            action: FragileAction::Drop,
            weight_multiplier: 0.0,
            rationale: format!("Severe downside tails ({which}) and LB near hurdle"),
        };
    }

    if rel_var_l > policy.rel_var_drop && near_hurdle {
        return FragileDecision {
            action: FragileAction::Drop,
            weight_multiplier: 0.0,
            rationale: "High L-sensitivity and LB near hurdle".to_string(),
        };
    }

    if severe_tail || rel_var_l > policy.rel_var_down || n < policy.min_n_down {
        let mut why: Vec<&str> = Vec::new();
        if severe_tail {
            why.push(if severe_tail_es {
                "severe tails (ES05/Q05)"
            } else {
                "severe tails (Q05)"
            });
        }
        if rel_var_l > policy.rel_var_down {
            why.push("high L-variability");
        }
        if n < policy.min_n_down {
            why.push("small sample");
        }
        return FragileDecision {
            action: FragileAction::Downweight,
            weight_multiplier: 0.50,
            rationale: format!("Advisory downweight: {}", why.join("; ")),
        };
    }

    FragileDecision {
        action: FragileAction::Keep,
        weight_multiplier: 1.0,
        rationale: "Robust enough to keep at full weight".to_string(),
    }
}
