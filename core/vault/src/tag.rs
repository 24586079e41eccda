//! Stored enum tags.

/// Declare a fieldless enum stored as a snake_case text tag.
///
/// Generates `ALL`, `as_str`, `label`, `FromStr` (unknown tags are a
/// validation failure on the given field) and `Display`.
macro_rules! tagged_enum {
    (
        $(#[$meta:meta])*
        $vis:vis enum $name:ident in $field:literal {
            $($(#[$vmeta:meta])* $variant:ident => ($tag:literal, $label:literal),)+
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
        $vis enum $name {
            $(
                $(#[$vmeta])*
                #[serde(rename = $tag)]
                $variant,
            )+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $tag,)+
                }
            }

            pub fn label(&self) -> &'static str {
                match self {
                    $(Self::$variant => $label,)+
                }
            }
        }

        impl std::str::FromStr for $name {
            type Err = dealvault_common::Error;

            fn from_str(s: &str) -> dealvault_common::Result<Self> {
                match s {
                    $($tag => Ok(Self::$variant),)+
                    other => Err(dealvault_common::Error::validation(
                        $field,
                        format!("'{}' is not a valid {}", other, $field),
                    )),
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

pub(crate) use tagged_enum;
