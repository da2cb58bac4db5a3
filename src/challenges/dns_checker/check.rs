use log::debug;

use crate::AcmeError;

// share of services that must answer without error, and share of those that must see the record
pub(crate) const FUNCTIONING_REQUIREMENT: f64 = 0.5;
pub(crate) const PROPAGATION_REQUIREMENT: f64 = 1.0;

/// Folds the per-service answers into one decision.
///
/// Too many erroring services is an error; otherwise the record counts as propagated only
/// when enough of the services that did answer found it.
pub(crate) fn evaluate(fqdn: &str, results: &[Result<bool, AcmeError>], functioning: f64, propagation: f64) -> Result<bool, AcmeError> {
    let total = results.len();
    let functional = results.iter().filter(|r| r.is_ok()).count();
    let found = results.iter().filter(|r| matches!(r, Ok(true))).count();

    let functional_rate = if total == 0 { 0.0 } else { functional as f64 / total as f64 };
    let propagation_rate = if functional == 0 { 0.0 } else { found as f64 / functional as f64 };
    debug!(
        "check {}: functional {}/{} ({:.0}%, min {:.0}%), propagated {}/{} ({:.0}%, min {:.0}%)",
        fqdn,
        functional,
        total,
        functional_rate * 100.0,
        functioning * 100.0,
        found,
        functional,
        propagation_rate * 100.0,
        propagation * 100.0
    );

    if functional_rate < functioning {
        return Err(AcmeError::Propagation(format!(
            "check {}: only {} of {} dns services answered",
            fqdn, functional, total
        )));
    }
    Ok(propagation_rate >= propagation)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn err() -> Result<bool, AcmeError> {
        Err(AcmeError::Propagation("servfail".to_string()))
    }

    fn run(results: &[Result<bool, AcmeError>]) -> Result<bool, AcmeError> {
        evaluate("_acme-challenge.a.com", results, FUNCTIONING_REQUIREMENT, PROPAGATION_REQUIREMENT)
    }

    #[test]
    fn three_present_one_erroring_propagates() {
        assert!(run(&[Ok(true), Ok(true), Ok(true), err()]).unwrap());
    }

    #[test]
    fn half_erroring_is_still_functional() {
        // 2/4 functional is exactly the requirement, not below it
        assert!(run(&[Ok(true), Ok(true), err(), err()]).unwrap());
        assert!(!run(&[Ok(true), Ok(false), err(), err()]).unwrap());
    }

    #[test]
    fn more_than_half_erroring_is_an_error() {
        assert!(matches!(run(&[Ok(true), err(), err(), err()]), Err(AcmeError::Propagation(_))));
        assert!(run(&[]).is_err());
    }

    #[test]
    fn any_functional_miss_blocks_propagation() {
        assert!(!run(&[Ok(true), Ok(true), Ok(true), Ok(false)]).unwrap());
    }
}
