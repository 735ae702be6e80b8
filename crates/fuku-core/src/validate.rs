use crate::error::{FukuError, Result};

/// Characters that would break resource naming (`fuku-{cluster}-{app}`, S3 keys)
const FORBIDDEN: &[(char, &str)] = &[
    ('-', "HYPHEN-MINUS"),
    ('_', "LOW LINE"),
    (' ', "SPACE"),
    ('/', "SOLIDUS"),
];

const RESERVED: &str = "fuku";

/// Check a user-supplied resource name before anything is created from it.
pub fn validate(name: &str) -> Result<()> {
    if let Some((_, label)) = FORBIDDEN.iter().find(|(c, _)| name.contains(*c)) {
        return Err(FukuError::usage(format!(
            "Invalid identifier in name: {}",
            label
        )));
    }
    if name == RESERVED {
        return Err(FukuError::usage(format!("\"{}\" is a reserved name", RESERVED)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_names_pass() {
        for name in ["prod", "api", "Main2", "fukuapp"] {
            assert!(validate(name).is_ok(), "{name} should be valid");
        }
    }

    #[test]
    fn test_forbidden_characters() {
        let cases = [
            ("my-app", "HYPHEN-MINUS"),
            ("my_app", "LOW LINE"),
            ("my app", "SPACE"),
            ("my/app", "SOLIDUS"),
        ];
        for (name, label) in cases {
            let err = validate(name).unwrap_err();
            assert_eq!(err.to_string(), format!("Invalid identifier in name: {label}"));
        }
    }

    #[test]
    fn test_reserved_name() {
        let err = validate("fuku").unwrap_err();
        assert_eq!(err.to_string(), "\"fuku\" is a reserved name");
    }
}
