use std::fmt;
use std::str::FromStr;

use rand::Rng;

use crate::candidate::Candidate;
use crate::error::Error;

/// characters drawn for ufrag/pwd values.
const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";

/// short-term credential lengths: ufrag at least 4 characters, pwd at
/// least 22.
pub const UFRAG_LEN: usize = 4;
pub const PWD_LEN: usize = 24;

pub fn random_string(len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect()
}

/// the session description block exchanged over signaling.
///
/// a newline-separated `key:value` text form:
///
/// ```text
/// ice-ufrag:WmZ6
/// ice-pwd:dGhlIHF1aWNrIGJyb3duIGZveA
/// candidate:7ab12c44 1 UDP 2130706431 192.0.2.1 54321 typ host
/// end-of-candidates
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Description {
    pub ufrag: String,
    pub pwd: String,
    pub candidates: Vec<Candidate>,
    pub end_of_candidates: bool,
}

impl fmt::Display for Description {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "ice-ufrag:{}", self.ufrag)?;
        writeln!(f, "ice-pwd:{}", self.pwd)?;
        for candidate in &self.candidates {
            writeln!(f, "candidate:{}", candidate.to_line())?;
        }

        if self.end_of_candidates {
            writeln!(f, "end-of-candidates")?;
        }

        Ok(())
    }
}

impl FromStr for Description {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        let mut description = Description::default();

        for line in s.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            if let Some(value) = line.strip_prefix("ice-ufrag:") {
                description.ufrag = value.trim().to_string();
            } else if let Some(value) = line.strip_prefix("ice-pwd:") {
                description.pwd = value.trim().to_string();
            } else if let Some(value) = line.strip_prefix("candidate:") {
                description.candidates.push(Candidate::from_line(value)?);
            } else if line == "end-of-candidates" {
                description.end_of_candidates = true;
            }
            // unknown keys are ignored for forward compatibility.
        }

        if description.ufrag.is_empty() || description.pwd.is_empty() {
            return Err(Error::Invalid("missing ice-ufrag or ice-pwd".to_string()));
        }

        Ok(description)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let description = Description {
            ufrag: random_string(UFRAG_LEN),
            pwd: random_string(PWD_LEN),
            candidates: vec![Candidate::host("192.0.2.1:54321".parse().unwrap(), 65535)],
            end_of_candidates: true,
        };

        let text = description.to_string();
        let parsed: Description = text.parse().unwrap();
        assert_eq!(parsed, description);
    }

    #[test]
    fn missing_credentials_rejected() {
        assert!("candidate:1 1 UDP 1 192.0.2.1 1 typ host\n"
            .parse::<Description>()
            .is_err());
    }

    #[test]
    fn credential_lengths() {
        assert!(random_string(UFRAG_LEN).len() >= 4);
        assert!(random_string(PWD_LEN).len() >= 22);
    }
}
