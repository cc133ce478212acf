use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::result_log::{test_shortname, TestRecord};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tally {
    pub passed: usize,
    pub failed: usize,
    pub total: usize,
}

impl Tally {
    pub fn of(records: &[TestRecord]) -> Self {
        let passed = records.iter().filter(|r| r.passed).count();
        let failed = records.len() - passed;
        Self { passed, failed, total: passed + failed }
    }

    /// `passed/failed/total`, the first field of a results line.
    pub fn fraction(&self) -> String {
        format!("{}/{}/{}", self.passed, self.failed, self.total)
    }
}

/// Per-test weights keyed by short test name; tests without an entry weigh `default`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Weights {
    #[serde(default = "default_weight")]
    pub default: f64,
    #[serde(default)]
    pub per_test: BTreeMap<String, f64>,
}

fn default_weight() -> f64 {
    1.0
}

impl Default for Weights {
    fn default() -> Self {
        Self { default: default_weight(), per_test: BTreeMap::new() }
    }
}

impl Weights {
    pub fn weight_of(&self, name: &str) -> f64 {
        self.per_test.get(test_shortname(name)).copied().unwrap_or(self.default)
    }

    pub fn is_uniform(&self) -> bool {
        self.per_test.values().all(|w| (*w - self.default).abs() < f64::EPSILON)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WeightedScore {
    pub points: f64,
    pub max_points: f64,
    /// `2 * 1 + 1 + 0 = 3`, shown to the submitter.
    pub computation: String,
}

impl WeightedScore {
    pub fn percent(&self) -> f64 {
        if self.max_points > 0.0 {
            self.points / self.max_points * 100.0
        } else {
            0.0
        }
    }
}

pub fn weighted_score(records: &[TestRecord], weights: &Weights) -> WeightedScore {
    let mut points = 0.0;
    let mut max_points = 0.0;
    let mut terms = vec![];
    for r in records {
        let w = weights.weight_of(&r.name);
        let mark = if r.passed { 1.0 } else { 0.0 };
        points += w * mark;
        max_points += w;
        if (w - 1.0).abs() < f64::EPSILON {
            terms.push(format!("{mark}"));
        } else {
            terms.push(format!("{w} * {mark}"));
        }
    }
    WeightedScore { points, max_points, computation: format!("{} = {points}", terms.join(" + ")) }
}

/// Plain-text report mailed to the submitter.
pub fn summary_text(records: &[TestRecord], weights: &Weights) -> String {
    let tally = Tally::of(records);
    let mut m = vec![
        format!("Summary:  Passed {:2}, Failed {:2}", tally.passed, tally.failed),
        "==============================".to_string(),
        String::new(),
    ];

    if weights.is_uniform() {
        let pct = if tally.total > 0 { tally.passed as f64 / tally.total as f64 * 100.0 } else { 0.0 };
        m.push(format!("Total mark for this assignment: {} / {} = {pct:.0}%", tally.passed, tally.total));
    } else {
        let score = weighted_score(records, weights);
        m.push(format!(
            "Total mark for this assignment: {} / {} = {:.0}%",
            score.points,
            score.max_points,
            score.percent()
        ));
        m.push(format!("(Points computed as {})", score.computation));
    }
    m.push(String::new());

    m.push("Pass/fail overview".into());
    m.push("==================".into());
    m.push(String::new());
    for r in records {
        if r.passed {
            m.push(format!("ok     :  {}", test_shortname(&r.name)));
        } else {
            m.push(format!("failed :  {}", test_shortname(&r.name)));
        }
    }
    m.push(String::new());

    if tally.failed > 0 {
        m.push("Test failure report".into());
        m.push("===================".into());
        m.push(String::new());
        for r in records.iter().filter(|r| !r.passed) {
            let name = test_shortname(&r.name);
            m.push(name.to_string());
            m.push("-".repeat(name.chars().count()));
            m.push(r.detail.clone().unwrap_or_default());
            m.push(String::new());
        }
    }
    m.join("\n")
}
