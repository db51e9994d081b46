//! Pure function mapping a triaged log + reason + metadata to a
//! priority, score and explainable breakdown.

use std::collections::HashMap;
use std::time::SystemTime;

use chrono::{Datelike, TimeZone, Timelike, Utc};

use crate::config::PriorityQueueConfig;
use crate::types::{IncidentMemory, LogRecord, Priority, PriorityBreakdown};

/// Result of scoring a single triage alert.
#[derive(Debug, Clone)]
pub struct PriorityResult {
    pub priority: Priority,
    pub score: f64,
    pub breakdown: PriorityBreakdown,
    pub reasoning: String,
}

/// Score a candidate alert from its log text, triage reason, any
/// service-identifying metadata and the current time, blending four
/// weighted sub-scores per `config.priority_weights`.
pub fn calculate_priority(
    log: &LogRecord,
    reason: &str,
    metadata: &HashMap<String, String>,
    now: SystemTime,
    config: &PriorityQueueConfig,
    history: Option<&IncidentMemory>,
) -> PriorityResult {
    let haystack = format!("{} {}", log.text, reason).to_lowercase();

    let keyword_score = keyword_sub_score(&haystack, config);
    let service_impact_score = service_impact_sub_score(&haystack, metadata, config);
    let time_context_score = time_context_sub_score(now, config);
    let historical_score = historical_sub_score(history);

    let w = &config.priority_weights;
    let score = (keyword_score * w.keyword
        + service_impact_score * w.service_impact
        + time_context_score * w.time_context
        + historical_score * w.historical)
        .clamp(0.0, 1.0);

    let priority = Priority::from_score(score);

    let breakdown = PriorityBreakdown {
        keyword_score,
        service_impact_score,
        time_context_score,
        historical_score,
    };

    let reasoning = format!(
        "priority={priority} score={score:.2} (keyword={keyword_score:.2}*{kw_w:.2}, \
         service_impact={service_impact_score:.2}*{si_w:.2}, time_context={time_context_score:.2}*{tc_w:.2}, \
         historical={historical_score:.2}*{hist_w:.2})",
        kw_w = w.keyword,
        si_w = w.service_impact,
        tc_w = w.time_context,
        hist_w = w.historical,
    );

    PriorityResult {
        priority,
        score,
        breakdown,
        reasoning,
    }
}

fn keyword_sub_score(haystack: &str, config: &PriorityQueueConfig) -> f64 {
    if config.critical_keywords.iter().any(|k| haystack.contains(k.as_str())) {
        1.0
    } else if config.high_keywords.iter().any(|k| haystack.contains(k.as_str())) {
        0.7
    } else if config.medium_keywords.iter().any(|k| haystack.contains(k.as_str())) {
        0.4
    } else {
        0.1
    }
}

fn service_impact_sub_score(
    haystack: &str,
    metadata: &HashMap<String, String>,
    config: &PriorityQueueConfig,
) -> f64 {
    let service_name = metadata.get("service").map(String::as_str);
    for profile in &config.services {
        let matches_metadata = service_name.map(|s| s.eq_ignore_ascii_case(&profile.name)).unwrap_or(false);
        let matches_text = haystack.contains(&profile.name.to_lowercase());
        if matches_metadata || matches_text {
            return profile.impact.clamp(0.0, 1.0);
        }
    }
    0.3
}

fn time_context_sub_score(now: SystemTime, config: &PriorityQueueConfig) -> f64 {
    let Some(hours) = &config.business_hours else {
        return 0.5;
    };
    let unix = now.duration_since(std::time::UNIX_EPOCH).unwrap_or_default().as_secs() as i64;
    let Some(dt) = Utc.timestamp_opt(unix, 0).single() else {
        return 0.5;
    };
    let hour = dt.hour() as u8;
    let is_weekday = dt.weekday().num_days_from_monday() < 5;
    let within_hours = hour >= hours.start_hour_utc && hour < hours.end_hour_utc;
    let in_business_hours = within_hours && (!hours.weekdays_only || is_weekday);
    // Incidents outside business hours carry more operational weight:
    // nobody is already watching the dashboards.
    if in_business_hours {
        0.4
    } else {
        0.8
    }
}

fn historical_sub_score(history: Option<&IncidentMemory>) -> f64 {
    match history {
        None => 0.3,
        Some(mem) => {
            let repeated = (mem.occurrences as f64 / 10.0).min(1.0);
            (0.3 + repeated * 0.6).min(1.0)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> PriorityQueueConfig {
        PriorityQueueConfig::default()
    }

    #[test]
    fn outage_keyword_yields_critical() {
        let log = LogRecord::new("service payments is experiencing a full outage");
        let result = calculate_priority(&log, "outage detected", &HashMap::new(), SystemTime::now(), &config(), None);
        assert_eq!(result.priority, Priority::Critical);
        assert!(result.score >= 0.85);
    }

    #[test]
    fn routine_text_yields_low() {
        let log = LogRecord::new("health check ok");
        let result = calculate_priority(&log, "health check ok", &HashMap::new(), SystemTime::now(), &config(), None);
        assert_eq!(result.priority, Priority::Low);
    }

    #[test]
    fn known_high_impact_service_raises_score() {
        let mut cfg = config();
        cfg.services.push(crate::config::ServiceProfile {
            name: "payments".into(),
            impact: 1.0,
        });
        let log = LogRecord::new("payments latency degraded");
        let mut meta = HashMap::new();
        meta.insert("service".to_string(), "payments".to_string());
        let result = calculate_priority(&log, "latency degraded", &meta, SystemTime::now(), &cfg, None);
        assert!(result.breakdown.service_impact_score >= 0.9);
    }

    #[test]
    fn repeated_incident_raises_historical_score() {
        let log = LogRecord::new("connection refused");
        let history = IncidentMemory {
            normalized_reason: "connection refused".into(),
            occurrences: 20,
            last_seen: SystemTime::now(),
        };
        let result = calculate_priority(&log, "connection refused", &HashMap::new(), SystemTime::now(), &config(), Some(&history));
        assert!(result.breakdown.historical_score > 0.3);
    }
}
