/// Declares a fieldless enum whose variants map onto SCPI character-data tokens.
///
/// The first literal is what we send, the optional `|` aliases are only accepted
/// when parsing. Matching is case-insensitive and tolerates surrounding quotes,
/// since string replies are double-quoted on the wire.
macro_rules! scpi_enum {
    (
        $(#[$meta:meta])*
        pub enum $name:ident : $kind:literal {
            $(
                $(#[$vmeta:meta])*
                $variant:ident => $token:literal $(| $alias:literal)*,
            )+
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
        pub enum $name {
            $(
                $(#[$vmeta])*
                $variant,
            )+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant,)+];

            pub fn token(&self) -> &'static str {
                match self {
                    $($name::$variant => $token,)+
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.token())
            }
        }

        impl std::str::FromStr for $name {
            type Err = crate::ProtocolError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let x = crate::scpi::unquote(s);
                $(
                    if x.eq_ignore_ascii_case($token) $(|| x.eq_ignore_ascii_case($alias))* {
                        return Ok($name::$variant);
                    }
                )+
                Err(crate::ProtocolError::UnknownToken {
                    kind: $kind,
                    value: x.to_string(),
                })
            }
        }
    };
}

/// Rejects a channel number outside of `1..=max` before anything is sent.
pub fn check_channel(kind: &str, channel: u8, max: u8) -> crate::Result<()> {
    if channel == 0 || channel > max {
        return Err(crate::Error::argument(anyhow::anyhow!(
            "{} channel {} out of range 1..={}",
            kind,
            channel,
            max
        )));
    }
    Ok(())
}

/// Rejects a non-finite value or one outside of `-limit..=limit`.
pub fn check_magnitude(what: &str, value: f64, limit: f64) -> crate::Result<()> {
    if !value.is_finite() || value.abs() > limit {
        return Err(crate::Error::argument(anyhow::anyhow!(
            "{} {} outside of +-{}",
            what,
            value,
            limit
        )));
    }
    Ok(())
}
