use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Deref;

/// Client-chosen keys. Unlike generated ids these carry no prefix: the
/// API layer validates their format before they ever reach an event.
macro_rules! entity_key {
    ($name:ident) => {
        #[derive(Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn from_raw(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl Deref for $name {
            type Target = str;
            fn deref(&self) -> &str {
                &self.0
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_owned())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<$name> for String {
            fn from(key: $name) -> String {
                key.0
            }
        }
    };
}

entity_key!(ProjectId);
entity_key!(FeatureName);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_keep_their_text() {
        let id = ProjectId::from_raw("default");
        assert_eq!(id.as_str(), "default");
        assert!(id.starts_with("def"));
        assert_eq!(String::from(id), "default");

        let name = FeatureName::from(String::from("checkout.new-flow"));
        assert_eq!(name.to_string(), "checkout.new-flow");
        assert_eq!(name, FeatureName::from("checkout.new-flow"));
    }

    #[test]
    fn serializes_as_plain_string() {
        let id = ProjectId::from("p1");
        assert_eq!(serde_json::to_string(&id).unwrap(), r#""p1""#);
        let parsed: ProjectId = serde_json::from_str(r#""p1""#).unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn orders_lexically() {
        let mut names = vec![FeatureName::from("beta"), FeatureName::from("alpha")];
        names.sort();
        assert_eq!(names[0].as_str(), "alpha");
    }
}
