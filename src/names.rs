//! Unit and application name handling.
//!
//! A unit name is `<application>/<ordinal>`, e.g. `mysql/0`. Application
//! names are lower-case alphanumeric words separated by single hyphens,
//! starting with a letter.

use crate::errors::GenerationError;

/// Derives the owning application name from a unit name.
pub fn unit_application(unit_name: &str) -> Result<String, GenerationError> {
    let invalid = || GenerationError::InvalidUnitName(format!("{:?} is not a valid unit name", unit_name));

    let (app, ordinal) = unit_name.split_once('/').ok_or_else(invalid)?;

    if ordinal.is_empty() || !ordinal.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid());
    }
    if !is_valid_application(app) {
        return Err(invalid());
    }

    Ok(app.to_string())
}

pub fn is_valid_application(name: &str) -> bool {
    if name.is_empty() || !name.starts_with(|c: char| c.is_ascii_lowercase()) {
        return false;
    }

    // No leading/trailing/doubled hyphens, and every word is alphanumeric.
    name.split('-').all(|word| {
        !word.is_empty()
            && word
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derives_application_from_unit() {
        assert_eq!(unit_application("mysql/0").unwrap(), "mysql");
        assert_eq!(unit_application("hadoop-name-node/37").unwrap(), "hadoop-name-node");
    }

    #[test]
    fn rejects_malformed_unit_names() {
        for name in [
            "mysql",
            "mysql/",
            "/0",
            "mysql/one",
            "mysql/0/1",
            "MySQL/0",
            "-mysql/0",
            "mysql-/0",
            "my--sql/0",
            "",
        ] {
            let err = unit_application(name).unwrap_err();
            assert!(
                matches!(err, GenerationError::InvalidUnitName(_)),
                "expected InvalidUnitName for {:?}, got {}",
                name,
                err
            );
        }
    }
}
