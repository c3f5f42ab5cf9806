/// Errors that can occur when creating validated text types.
#[derive(Debug, thiserror::Error)]
pub enum TextError {
    /// The input text was empty or contained only whitespace
    #[error("Text cannot be empty")]
    Empty,
    /// The input text exceeded the maximum allowed length
    #[error("Text exceeds maximum length of {0} characters")]
    TooLong(usize),
}

/// Maximum length of a [`Label`], in characters of the trimmed input.
pub const MAX_LABEL_LEN: usize = 100;

/// A display label for statuses, actors and sites.
///
/// This type wraps a `String` and guarantees it contains at least one
/// non-whitespace character and is no longer than [`MAX_LABEL_LEN`] characters.
/// The input is trimmed of leading and trailing whitespace during construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Label(String);

impl Label {
    /// Creates a new `Label` from the given input.
    ///
    /// The input is trimmed of leading and trailing whitespace. If the trimmed
    /// result is empty or too long, an error is returned.
    ///
    /// # Arguments
    ///
    /// * `input` - Any type that can be converted to a string reference
    ///
    /// # Returns
    ///
    /// Returns `Ok(Label)` if the trimmed input is non-empty and within bounds,
    /// `Err(TextError::Empty)` if it's empty or contains only whitespace, or
    /// `Err(TextError::TooLong)` if it exceeds [`MAX_LABEL_LEN`] characters.
    pub fn new(input: impl AsRef<str>) -> Result<Self, TextError> {
        let trimmed = input.as_ref().trim();
        if trimmed.is_empty() {
            return Err(TextError::Empty);
        }
        if trimmed.chars().count() > MAX_LABEL_LEN {
            return Err(TextError::TooLong(MAX_LABEL_LEN));
        }
        Ok(Self(trimmed.to_owned()))
    }

    /// Returns the inner string as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns a lowercase key for case-insensitive ordering and comparison.
    ///
    /// Notification recipient lists are sorted case-insensitively by site and
    /// actor label; this is the key used for that sort.
    pub fn sort_key(&self) -> String {
        self.0.to_lowercase()
    }

    /// Case-insensitive equality against another label.
    pub fn eq_ignore_case(&self, other: &Label) -> bool {
        self.0.eq_ignore_ascii_case(&other.0)
    }
}

impl std::fmt::Display for Label {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for Label {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl serde::Serialize for Label {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> serde::Deserialize<'de> for Label {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Label::new(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trims_surrounding_whitespace() {
        let label = Label::new("  Providing Lab  ").expect("valid label");
        assert_eq!(label.as_str(), "Providing Lab");
    }

    #[test]
    fn rejects_whitespace_only_input() {
        let err = Label::new("   ").expect_err("expected validation failure");
        assert!(matches!(err, TextError::Empty));
    }

    #[test]
    fn rejects_over_length_input() {
        let long = "x".repeat(MAX_LABEL_LEN + 1);
        let err = Label::new(long).expect_err("expected validation failure");
        assert!(matches!(err, TextError::TooLong(_)));
    }

    #[test]
    fn sort_key_is_case_insensitive() {
        let upper = Label::new("IRB").expect("valid label");
        let lower = Label::new("irb").expect("valid label");
        assert_eq!(upper.sort_key(), lower.sort_key());
        assert!(upper.eq_ignore_case(&lower));
    }
}
