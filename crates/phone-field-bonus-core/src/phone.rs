use crate::{UserRecord, USER_FIELD_PREFIX};

pub const MIN_PHONE_DIGITS: usize = 8;
pub const MAX_PHONE_DIGITS: usize = 15;

/// Reads the phone value for `field_id`, preferring the typed user field and
/// falling back to the `user_field_<id>` custom field.
#[must_use]
pub fn extract_phone<'a>(user: &'a UserRecord, field_id: &str) -> Option<&'a str> {
    if let Some(value) = user.user_fields.get(field_id) {
        if !is_blank(value) {
            return Some(value.as_str());
        }
    }

    user.custom_fields
        .get(&format!("{USER_FIELD_PREFIX}{field_id}"))
        .map(String::as_str)
}

/// Digit-only projection of a raw phone value.
#[must_use]
pub fn phone_digits(raw: &str) -> String {
    raw.chars().filter(char::is_ascii_digit).collect()
}

#[must_use]
pub fn is_valid_phone(raw: Option<&str>) -> bool {
    let Some(value) = raw else {
        return false;
    };
    if is_blank(value) {
        return false;
    }

    let digits = value.chars().filter(char::is_ascii_digit).count();
    (MIN_PHONE_DIGITS..=MAX_PHONE_DIGITS).contains(&digits)
}

fn is_blank(value: &str) -> bool {
    value.trim().is_empty()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::BTreeMap;

    fn user_with(
        user_fields: &[(&str, &str)],
        custom_fields: &[(&str, &str)],
    ) -> UserRecord {
        let to_map = |pairs: &[(&str, &str)]| {
            pairs
                .iter()
                .map(|(name, value)| ((*name).to_string(), (*value).to_string()))
                .collect::<BTreeMap<_, _>>()
        };
        UserRecord {
            id: crate::UserId(7),
            user_fields: to_map(user_fields),
            custom_fields: to_map(custom_fields),
        }
    }

    #[test]
    fn typed_field_wins_over_custom_field() {
        let user = user_with(&[("1", "+1 555 0100")], &[("user_field_1", "999")]);
        assert_eq!(extract_phone(&user, "1"), Some("+1 555 0100"));
    }

    #[test]
    fn blank_typed_field_falls_back_to_custom_field() {
        let user = user_with(&[("1", "   ")], &[("user_field_1", "0612345678")]);
        assert_eq!(extract_phone(&user, "1"), Some("0612345678"));
    }

    #[test]
    fn missing_everywhere_is_none() {
        let user = user_with(&[("2", "0612345678")], &[]);
        assert_eq!(extract_phone(&user, "1"), None);
    }

    #[test]
    fn formatted_us_number_is_valid() {
        assert_eq!(phone_digits("+1 (555) 123-4567"), "15551234567");
        assert!(is_valid_phone(Some("+1 (555) 123-4567")));
    }

    #[test]
    fn short_number_is_invalid() {
        assert!(!is_valid_phone(Some("12345")));
    }

    #[test]
    fn bounds_are_inclusive() {
        assert!(is_valid_phone(Some("12345678")));
        assert!(is_valid_phone(Some("123456789012345")));
        assert!(!is_valid_phone(Some("1234567")));
        assert!(!is_valid_phone(Some("1234567890123456")));
    }

    #[test]
    fn absent_and_blank_are_invalid() {
        assert!(!is_valid_phone(None));
        assert!(!is_valid_phone(Some("")));
        assert!(!is_valid_phone(Some(" \t ")));
    }

    #[test]
    fn non_ascii_digits_do_not_count() {
        // Arabic-Indic digits are not ASCII digits.
        assert!(!is_valid_phone(Some("١٢٣٤٥٦٧٨٩")));
    }

    proptest! {
        #[test]
        fn validity_matches_digit_projection_length(raw in "[0-9 ()+.a-z-]{0,40}") {
            let expected = (MIN_PHONE_DIGITS..=MAX_PHONE_DIGITS)
                .contains(&phone_digits(&raw).len());
            prop_assert_eq!(is_valid_phone(Some(&raw)), expected);
        }
    }
}
