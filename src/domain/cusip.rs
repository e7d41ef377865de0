//! CUSIP normalisation, check-digit validation and CUSIP -> ticker mapping.

use crate::domain::error::Form13fError;
use std::collections::HashMap;
use std::io::BufRead;
use tracing::warn;

pub const CUSIP_LEN: usize = 9;

/// Left-pad with zeros to nine characters and uppercase.
///
/// Filings occasionally drop leading zeros from numeric issuer codes.
pub fn normalize_cusip(raw: &str) -> String {
    let trimmed = raw.trim().to_uppercase();
    if trimmed.len() >= CUSIP_LEN {
        return trimmed;
    }
    format!("{}{}", "0".repeat(CUSIP_LEN - trimmed.len()), trimmed)
}

fn char_value(c: char) -> Option<u32> {
    match c {
        '0'..='9' => c.to_digit(10),
        'A'..='Z' => Some(c as u32 - 'A' as u32 + 10),
        '*' => Some(36),
        '@' => Some(37),
        '#' => Some(38),
        _ => None,
    }
}

/// Modulus 10 "double add double" check over the first eight characters.
pub fn is_valid_cusip(cusip: &str) -> bool {
    let chars: Vec<char> = cusip.chars().collect();
    if chars.len() != CUSIP_LEN {
        return false;
    }
    let Some(check) = chars[8].to_digit(10) else {
        return false;
    };

    let mut sum = 0;
    for (i, &c) in chars[..8].iter().enumerate() {
        let Some(mut v) = char_value(c) else {
            return false;
        };
        if i % 2 == 1 {
            v *= 2;
        }
        sum += v / 10 + v % 10;
    }
    (10 - sum % 10) % 10 == check
}

/// CUSIP -> ticker lookup built from SEC fails-to-deliver files.
#[derive(Debug, Clone, Default)]
pub struct CusipMap {
    entries: HashMap<String, String>,
}

impl CusipMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn insert(&mut self, cusip: &str, ticker: &str) {
        self.entries
            .insert(normalize_cusip(cusip), ticker.to_string());
    }

    /// Merge one pipe-delimited fails-to-deliver file
    /// (`SETTLEMENT DATE|CUSIP|SYMBOL|...`). Later files win on conflicts.
    pub fn load_fails_file<R: BufRead>(
        &mut self,
        reader: R,
        source_name: &str,
    ) -> Result<usize, Form13fError> {
        let mut added = 0;
        for raw in reader.split(b'\n') {
            let raw = raw.map_err(|e| Form13fError::Import {
                source_name: source_name.to_string(),
                reason: e.to_string(),
            })?;
            // SEC files are nominally ASCII; stray bytes are dropped
            let ascii: Vec<u8> = raw.into_iter().filter(u8::is_ascii).collect();
            let line = String::from_utf8_lossy(&ascii);
            let line = line.trim_end_matches('\r');
            let cols: Vec<&str> = line.split('|').collect();
            if cols.len() <= 2 {
                continue;
            }
            let cusip = cols[1].trim();
            if cusip.is_empty() || cusip == "CUSIP" {
                continue;
            }
            // SEC pads some symbols with filler letters
            let ticker = cols[2].trim().replace("XXXX", "").replace("ZZZZ", "");
            if ticker.is_empty() {
                continue;
            }
            self.entries.insert(normalize_cusip(cusip), ticker);
            added += 1;
        }
        Ok(added)
    }

    pub fn ticker(&self, cusip: &str) -> Option<&str> {
        self.entries.get(&normalize_cusip(cusip)).map(String::as_str)
    }

    /// Ticker for `cusip`, or the normalised CUSIP itself when unmapped.
    pub fn resolve(&self, cusip: &str) -> String {
        let normalized = normalize_cusip(cusip);
        if !is_valid_cusip(&normalized) {
            warn!(cusip = %normalized, "CUSIP did not match checksum");
        }
        match self.ticker(&normalized) {
            Some(ticker) => ticker.to_string(),
            None => {
                warn!(cusip = %normalized, "CUSIP not in mapping, keeping it as the instrument");
                normalized
            }
        }
    }
}
