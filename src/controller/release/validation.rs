use crate::controller::condition::Condition;
use crate::crd::release::{MetricCheck, ReleaseSpec};
use std::collections::HashSet;
use std::time::Duration;
use thiserror::Error;

/// Release spec rejected before any traffic moves
#[derive(Debug, Error, Clone, PartialEq)]
#[error("{0}")]
pub struct ValidationError(pub String);

impl ValidationError {
    fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Validate a Release specification
///
/// Validates constraints the CRD schema cannot express. Runs when `start`
/// creates a release and again when the reconciler first sees one, which
/// covers resources applied directly to the cluster.
///
/// # Validation Rules
/// - `appName` and `image` cannot be empty
/// - `replicas` must be >= 0
/// - exactly one of `canary` / `blueGreen`
/// - canary `trafficSteps`: non-empty, each 0-100, non-decreasing, ending at 100
/// - `analysisInterval` must parse (e.g. "30s", "5m")
/// - `failureThreshold` must be >= 1
/// - metric names unique and non-empty, conditions must parse
/// - traffic routing names cannot be empty
pub fn validate_spec(spec: &ReleaseSpec) -> Result<(), ValidationError> {
    if spec.app_name.trim().is_empty() {
        return Err(ValidationError::new("spec.appName cannot be empty"));
    }
    if spec.image.trim().is_empty() {
        return Err(ValidationError::new("spec.image cannot be empty"));
    }
    if spec.replicas < 0 {
        return Err(ValidationError(format!(
            "spec.replicas must be >= 0, got {}",
            spec.replicas
        )));
    }

    match (&spec.strategy.canary, &spec.strategy.blue_green) {
        (Some(canary), None) => {
            validate_traffic_steps(&canary.traffic_steps)?;
            validate_analysis(
                "spec.strategy.canary",
                &canary.analysis_interval,
                canary.failure_threshold,
                &canary.metrics,
            )?;
        }
        (None, Some(bg)) => {
            validate_analysis(
                "spec.strategy.blueGreen",
                &bg.analysis_interval,
                bg.failure_threshold,
                &bg.metrics,
            )?;
        }
        (Some(_), Some(_)) => {
            return Err(ValidationError::new(
                "spec.strategy must set exactly one of canary or blueGreen, got both",
            ))
        }
        (None, None) => {
            return Err(ValidationError::new(
                "spec.strategy must set exactly one of canary or blueGreen",
            ))
        }
    }

    if let Some(routing) = &spec.traffic_routing {
        for (field, value) in [
            ("httpRoute", &routing.http_route),
            ("stableService", &routing.stable_service),
            ("canaryService", &routing.canary_service),
        ] {
            if value.trim().is_empty() {
                return Err(ValidationError(format!(
                    "spec.trafficRouting.{} cannot be empty",
                    field
                )));
            }
        }
        if let Some(port) = routing.port {
            if !(1..=65535).contains(&port) {
                return Err(ValidationError(format!(
                    "spec.trafficRouting.port must be 1-65535, got {}",
                    port
                )));
            }
        }
    }

    Ok(())
}

fn validate_traffic_steps(steps: &[u8]) -> Result<(), ValidationError> {
    if steps.is_empty() {
        return Err(ValidationError::new(
            "spec.strategy.canary.trafficSteps must have at least one step",
        ));
    }

    for (i, weight) in steps.iter().enumerate() {
        if *weight > 100 {
            return Err(ValidationError(format!(
                "trafficSteps[{}] must be 0-100, got {}",
                i, weight
            )));
        }
    }

    if let Some(i) = steps.windows(2).position(|w| w[1] < w[0]) {
        return Err(ValidationError(format!(
            "trafficSteps must be non-decreasing: trafficSteps[{}]={} follows {}",
            i + 1,
            steps[i + 1],
            steps[i]
        )));
    }

    if steps.last() != Some(&100) {
        return Err(ValidationError::new(
            "spec.strategy.canary.trafficSteps must end at 100",
        ));
    }

    Ok(())
}

fn validate_analysis(
    path: &str,
    interval: &str,
    failure_threshold: u32,
    metrics: &[MetricCheck],
) -> Result<(), ValidationError> {
    if parse_duration(interval).is_none() {
        return Err(ValidationError(format!(
            "{}.analysisInterval invalid: '{}'",
            path, interval
        )));
    }

    if failure_threshold == 0 {
        return Err(ValidationError(format!(
            "{}.failureThreshold must be >= 1",
            path
        )));
    }

    let mut seen = HashSet::new();
    for (i, metric) in metrics.iter().enumerate() {
        if metric.name.trim().is_empty() {
            return Err(ValidationError(format!(
                "{}.metrics[{}].name cannot be empty",
                path, i
            )));
        }
        if !seen.insert(metric.name.as_str()) {
            return Err(ValidationError(format!(
                "{}.metrics[{}].name '{}' is duplicated",
                path, i, metric.name
            )));
        }
        if metric.query.trim().is_empty() {
            return Err(ValidationError(format!(
                "{}.metrics[{}].query cannot be empty",
                path, i
            )));
        }
        Condition::parse(&metric.success_condition).map_err(|e| {
            ValidationError(format!("{}.metrics[{}].successCondition: {}", path, i, e))
        })?;
        if let Some(failure) = &metric.failure_condition {
            Condition::parse(failure).map_err(|e| {
                ValidationError(format!("{}.metrics[{}].failureCondition: {}", path, i, e))
            })?;
        }
    }

    Ok(())
}

/// Parse a duration string like "5m", "30s", "1h" into std::time::Duration
///
/// Limits: seconds and minutes up to 24h, hours up to one week. Zero and
/// unit-less values are rejected.
pub fn parse_duration(duration_str: &str) -> Option<Duration> {
    let duration_str = duration_str.trim();
    let unit = duration_str.chars().last()?;
    let number: u64 = duration_str[..duration_str.len() - unit.len_utf8()]
        .parse()
        .ok()?;

    if number == 0 {
        return None;
    }

    let (limit, scale) = match unit {
        's' => (86_400, 1),
        'm' => (1_440, 60),
        'h' => (168, 3_600),
        _ => return None,
    };

    if number > limit {
        return None;
    }
    number.checked_mul(scale).map(Duration::from_secs)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::crd::release::{BlueGreenStrategy, CanaryStrategy, ReleaseStrategy};

    fn canary_spec(steps: Vec<u8>) -> ReleaseSpec {
        ReleaseSpec {
            app_name: "checkout".to_string(),
            image: "checkout:2".to_string(),
            stable_image: Some("checkout:1".to_string()),
            replicas: 4,
            strategy: ReleaseStrategy {
                canary: Some(CanaryStrategy {
                    traffic_steps: steps,
                    analysis_interval: "1m".to_string(),
                    failure_threshold: 2,
                    inconclusive_limit: None,
                    metrics: vec![MetricCheck {
                        name: "error-rate".to_string(),
                        query: "errors".to_string(),
                        success_condition: "result < 0.05".to_string(),
                        failure_condition: Some("result > 0.2".to_string()),
                        predictive_analysis: None,
                    }],
                }),
                blue_green: None,
            },
            traffic_routing: None,
            auto_promote: None,
            public_key: None,
            signature: None,
        }
    }

    #[test]
    fn test_valid_canary_spec() {
        assert_eq!(validate_spec(&canary_spec(vec![20, 50, 100])), Ok(()));
        assert_eq!(validate_spec(&canary_spec(vec![100])), Ok(()));
        // Repeated weights hold a split for an extra interval
        assert_eq!(validate_spec(&canary_spec(vec![10, 10, 100])), Ok(()));
    }

    #[test]
    fn test_traffic_step_rules() {
        let err = validate_spec(&canary_spec(vec![])).unwrap_err();
        assert!(err.0.contains("at least one step"));

        let err = validate_spec(&canary_spec(vec![20, 150])).unwrap_err();
        assert!(err.0.contains("0-100"));

        let err = validate_spec(&canary_spec(vec![50, 20, 100])).unwrap_err();
        assert!(err.0.contains("non-decreasing"));

        let err = validate_spec(&canary_spec(vec![20, 50])).unwrap_err();
        assert!(err.0.contains("end at 100"));
    }

    #[test]
    fn test_strategy_must_be_exactly_one() {
        let mut spec = canary_spec(vec![100]);
        spec.strategy.blue_green = Some(BlueGreenStrategy {
            analysis_interval: "1m".to_string(),
            failure_threshold: 1,
            inconclusive_limit: None,
            metrics: vec![],
        });
        assert!(validate_spec(&spec).unwrap_err().0.contains("got both"));

        spec.strategy = ReleaseStrategy::default();
        assert!(validate_spec(&spec).is_err());
    }

    #[test]
    fn test_bad_condition_is_rejected() {
        let mut spec = canary_spec(vec![100]);
        if let Some(canary) = spec.strategy.canary.as_mut() {
            canary.metrics[0].success_condition = "latency < 5".to_string();
        }
        let err = validate_spec(&spec).unwrap_err();
        assert!(err.0.contains("successCondition"));
    }

    #[test]
    fn test_duplicate_metric_names() {
        let mut spec = canary_spec(vec![100]);
        if let Some(canary) = spec.strategy.canary.as_mut() {
            let dup = canary.metrics[0].clone();
            canary.metrics.push(dup);
        }
        assert!(validate_spec(&spec).unwrap_err().0.contains("duplicated"));
    }

    #[test]
    fn test_zero_failure_threshold() {
        let mut spec = canary_spec(vec![100]);
        if let Some(canary) = spec.strategy.canary.as_mut() {
            canary.failure_threshold = 0;
        }
        assert!(validate_spec(&spec).unwrap_err().0.contains("failureThreshold"));
    }

    #[test]
    fn test_negative_replicas() {
        let mut spec = canary_spec(vec![100]);
        spec.replicas = -1;
        assert!(validate_spec(&spec).is_err());
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("30s"), Some(Duration::from_secs(30)));
        assert_eq!(parse_duration("5m"), Some(Duration::from_secs(300)));
        assert_eq!(parse_duration("2h"), Some(Duration::from_secs(7200)));
        assert_eq!(parse_duration(" 1m "), Some(Duration::from_secs(60)));

        assert_eq!(parse_duration(""), None);
        assert_eq!(parse_duration("0s"), None);
        assert_eq!(parse_duration("30"), None);
        assert_eq!(parse_duration("1d"), None);
        assert_eq!(parse_duration("86401s"), None);
        assert_eq!(parse_duration("169h"), None);
        assert_eq!(parse_duration("-5m"), None);
    }
}
