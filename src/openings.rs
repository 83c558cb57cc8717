use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use anyhow::Context;
use serde::Serialize;

use crate::util::Res;

/// An ECO code and human-readable opening name, e.g. `B00` / `King's Pawn
/// Game`.
#[derive(Debug, Clone, Eq, PartialEq, Serialize)]
pub struct Opening {
    pub eco: String,
    pub name: String,
}

/// Opening names keyed by EPD (the first four FEN fields). Built once at
/// startup from a `eco \t name \t epd` TSV and injected wherever needed;
/// nothing in the crate holds a global copy.
#[derive(Debug, Default)]
pub struct Openings {
    by_epd: HashMap<String, Opening>,
}

impl Openings {
    pub fn load_tsv(path: impl AsRef<Path>) -> Res<Openings> {
        let path = path.as_ref();
        let file = File::open(path)
            .with_context(|| format!("opening names table {}", path.display()))?;
        Openings::from_tsv_reader(BufReader::new(file))
    }

    /// Lines of `eco \t name \t epd`; a header line and blank lines are
    /// tolerated, anything else malformed is an error.
    pub fn from_tsv_reader(reader: impl BufRead) -> Res<Openings> {
        let mut by_epd = HashMap::new();
        for (line_no, line) in reader.lines().enumerate() {
            let line = line.context("reading opening names table")?;
            let line = line.trim_end();
            if line.is_empty() || (line_no == 0 && line.starts_with("eco\t")) {
                continue;
            }
            let mut fields = line.splitn(3, '\t');
            let (Some(eco), Some(name), Some(epd)) =
                (fields.next(), fields.next(), fields.next())
            else {
                anyhow::bail!("malformed opening names line {}: {line:?}", line_no + 1);
            };
            let _ = by_epd.insert(
                epd.trim().to_owned(),
                Opening { eco: eco.to_owned(), name: name.to_owned() },
            );
        }
        Ok(Openings { by_epd })
    }

    #[must_use]
    pub fn classify(&self, epd: &str) -> Option<&Opening> {
        self.by_epd.get(epd)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.by_epd.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_epd.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TABLE: &str = "eco\tname\tepd\n\
        B00\tKing's Pawn Game\trnbqkbnr/pppppppp/8/8/4P3/8/PPPP1PPP/RNBQKBNR b KQkq e3\n\
        A40\tQueen's Pawn Game\trnbqkbnr/pppppppp/8/8/3P4/8/PPP1PPPP/RNBQKBNR b KQkq d3\n";

    #[test]
    fn classifies_known_epds() {
        let openings = Openings::from_tsv_reader(TABLE.as_bytes()).unwrap();
        assert_eq!(openings.len(), 2);
        let opening = openings
            .classify("rnbqkbnr/pppppppp/8/8/4P3/8/PPPP1PPP/RNBQKBNR b KQkq e3")
            .unwrap();
        assert_eq!(opening.eco, "B00");
        assert_eq!(opening.name, "King's Pawn Game");
        assert!(openings.classify("8/8/8/8/8/8/8/8 w - -").is_none());
    }

    #[test]
    fn rejects_malformed_lines() {
        assert!(Openings::from_tsv_reader("B00 only-two-fields\n".as_bytes()).is_err());
    }
}
