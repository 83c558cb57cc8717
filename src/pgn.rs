use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use anyhow::Context;
use shakmaty::san::SanPlus;

use crate::model::GameOutcome;
use crate::util::Res;

/// One game pulled out of a PGN archive, reduced to what indexing needs.
#[derive(Debug, Clone)]
pub struct ParsedGame {
    pub moves: Vec<SanPlus>,
    pub outcome: GameOutcome,
    /// Rounded mean of `WhiteElo` and `BlackElo` when both are present.
    pub average_rating: Option<u32>,
    pub event: Option<String>,
    pub year: Option<u16>,
}

/// Predicates a game must pass to be emitted. A failing game is counted as
/// skipped, exactly like a game with an unusable result.
#[derive(Debug, Clone, Default)]
pub struct GameFilter {
    pub min_rating: Option<u32>,
    pub min_year: Option<u16>,
    /// Allowed `TimeControl` header values; `None` admits everything.
    pub time_controls: Option<Vec<String>>,
}

impl GameFilter {
    fn admits(&self, game: &ParsedGame, time_control: Option<&str>) -> bool {
        if let Some(min) = self.min_rating {
            if game.average_rating.is_none_or(|rating| rating < min) {
                return false;
            }
        }
        if let Some(min) = self.min_year {
            if game.year.is_none_or(|year| year < min) {
                return false;
            }
        }
        if let Some(allowed) = &self.time_controls {
            if !time_control.is_some_and(|tc| allowed.iter().any(|a| a == tc)) {
                return false;
            }
        }
        true
    }
}

pub const DEFAULT_PROGRESS_EVERY: u64 = 10_000;

type ProgressHook = Box<dyn FnMut(u64, u64) + Send>;

/// Streams games out of a PGN file without materializing the archive.
/// Pull-based: call [`PgnStream::next_game`] until it returns `None`.
pub struct PgnStream<R> {
    reader: R,
    filter: GameFilter,
    /// A line that belongs to the next record, read while finishing the
    /// previous one.
    pushback: Option<String>,
    parsed: u64,
    skipped: u64,
    progress_every: u64,
    progress: Option<ProgressHook>,
}

impl PgnStream<BufReader<File>> {
    pub fn open(path: impl AsRef<Path>, filter: GameFilter) -> Res<Self> {
        let path = path.as_ref();
        let file =
            File::open(path).with_context(|| format!("opening PGN file {}", path.display()))?;
        Ok(PgnStream::new(BufReader::new(file), filter))
    }
}

impl<R: BufRead> PgnStream<R> {
    pub fn new(reader: R, filter: GameFilter) -> Self {
        PgnStream {
            reader,
            filter,
            pushback: None,
            parsed: 0,
            skipped: 0,
            progress_every: DEFAULT_PROGRESS_EVERY,
            progress: None,
        }
    }

    /// Installs a hook invoked with the running `(parsed, skipped)` counts
    /// every `every` games seen.
    pub fn with_progress(mut self, every: u64, hook: impl FnMut(u64, u64) + Send + 'static) -> Self {
        self.progress_every = every.max(1);
        self.progress = Some(Box::new(hook));
        self
    }

    #[must_use]
    pub fn counts(&self) -> (u64, u64) {
        (self.parsed, self.skipped)
    }

    /// Pulls the next game passing the filters. Games with unusable results
    /// or failing a filter are counted as skipped and the stream moves on.
    /// Returns `None` at end of file; I/O failures surface as errors.
    pub fn next_game(&mut self) -> Option<Res<ParsedGame>> {
        loop {
            let record = match self.read_record() {
                Ok(Some(record)) => record,
                Ok(None) => return None,
                Err(err) => return Some(Err(err)),
            };
            let outcome = record.outcome();
            let average_rating = record.average_rating();
            let event = record.tag("Event").map(str::to_owned);
            let year = record.year();
            let time_control = record_time_control(&record.tags);
            let game = outcome.map(|outcome| ParsedGame {
                moves: record.moves,
                outcome,
                average_rating,
                event,
                year,
            });
            let emitted = match game {
                Some(game) if self.filter.admits(&game, time_control) => {
                    self.parsed += 1;
                    Some(game)
                }
                _ => {
                    self.skipped += 1;
                    None
                }
            };
            if (self.parsed + self.skipped) % self.progress_every == 0 {
                if let Some(hook) = &mut self.progress {
                    hook(self.parsed, self.skipped);
                }
            }
            if let Some(game) = emitted {
                return Some(Ok(game));
            }
        }
    }

    fn next_line(&mut self) -> Res<Option<String>> {
        if let Some(line) = self.pushback.take() {
            return Ok(Some(line));
        }
        let mut line = String::new();
        let n = self.reader.read_line(&mut line).context("reading PGN line")?;
        if n == 0 {
            return Ok(None);
        }
        while line.ends_with('\n') || line.ends_with('\r') {
            line.pop();
        }
        Ok(Some(line))
    }

    /// Reads one blank-line-separated record: a header block followed by a
    /// moves block. The last record of the file is returned even without a
    /// trailing blank line.
    fn read_record(&mut self) -> Res<Option<RawRecord>> {
        let mut record = RawRecord::default();
        let mut in_headers = true;
        let mut movetext = MovetextCleaner::default();
        let mut saw_anything = false;
        loop {
            let Some(line) = self.next_line()? else {
                return Ok(saw_anything.then_some(record));
            };
            let trimmed = line.trim();
            if trimmed.is_empty() {
                if in_headers && saw_anything {
                    in_headers = false;
                    continue;
                }
                if saw_anything && !in_headers {
                    return Ok(Some(record));
                }
                continue;
            }
            if trimmed.starts_with('[') && in_headers {
                saw_anything = true;
                if let Some((tag, value)) = parse_header_line(trimmed) {
                    record.tags.push((tag.to_owned(), value.to_owned()));
                }
                continue;
            }
            if trimmed.starts_with('[') && !in_headers && movetext.at_top_level() {
                // Next record's headers; some archives omit the blank line.
                self.pushback = Some(line);
                return Ok(Some(record));
            }
            saw_anything = true;
            in_headers = false;
            movetext.feed(trimmed, &mut record.moves);
        }
    }
}

fn record_time_control<'a>(tags: &'a [(String, String)]) -> Option<&'a str> {
    tags.iter().find(|(tag, _)| tag == "TimeControl").map(|(_, value)| value.as_str())
}

#[derive(Debug, Default)]
struct RawRecord {
    tags: Vec<(String, String)>,
    moves: Vec<SanPlus>,
}

impl RawRecord {
    fn tag(&self, name: &str) -> Option<&str> {
        self.tags.iter().find(|(tag, _)| tag == name).map(|(_, value)| value.as_str())
    }

    /// `None` for `*` and anything else unusable; such games are skipped.
    fn outcome(&self) -> Option<GameOutcome> {
        match self.tag("Result") {
            Some("1-0") => Some(GameOutcome::WhiteWins),
            Some("0-1") => Some(GameOutcome::BlackWins),
            Some("1/2-1/2") => Some(GameOutcome::Draw),
            _ => None,
        }
    }

    fn average_rating(&self) -> Option<u32> {
        let white: u32 = self.tag("WhiteElo")?.parse().ok()?;
        let black: u32 = self.tag("BlackElo")?.parse().ok()?;
        Some((white + black).div_ceil(2))
    }

    fn year(&self) -> Option<u16> {
        self.tag("Date")?.get(0..4)?.parse().ok()
    }
}

/// `[Tag "Value"]`, tolerant of embedded quotes in the value.
fn parse_header_line(line: &str) -> Option<(&str, &str)> {
    let inner = line.strip_prefix('[')?.strip_suffix(']')?;
    let quote = inner.find('"')?;
    let tag = inner[..quote].trim();
    let value = inner[quote + 1..].strip_suffix('"')?;
    (!tag.is_empty()).then_some((tag, value))
}

/// Strips brace comments, nested parenthesized variations, NAGs, move
/// numbers and result tokens from movetext, keeping only SAN moves.
/// Comment and variation state persists across lines.
#[derive(Debug, Default)]
struct MovetextCleaner {
    in_comment: bool,
    variation_depth: u32,
}

impl MovetextCleaner {
    fn at_top_level(&self) -> bool {
        !self.in_comment && self.variation_depth == 0
    }

    fn feed(&mut self, line: &str, moves: &mut Vec<SanPlus>) {
        let mut token = String::new();
        for ch in line.chars().chain(std::iter::once(' ')) {
            if self.in_comment {
                if ch == '}' {
                    self.in_comment = false;
                }
                continue;
            }
            match ch {
                '{' => {
                    self.flush(&mut token, moves);
                    self.in_comment = true;
                }
                '(' => {
                    self.flush(&mut token, moves);
                    self.variation_depth += 1;
                }
                ')' => {
                    self.flush(&mut token, moves);
                    self.variation_depth = self.variation_depth.saturating_sub(1);
                }
                ch if ch.is_whitespace() => self.flush(&mut token, moves),
                ch => token.push(ch),
            }
        }
    }

    fn flush(&mut self, token: &mut String, moves: &mut Vec<SanPlus>) {
        if !token.is_empty() && self.variation_depth == 0 {
            if let Some(san) = san_token(token) {
                moves.push(san);
            }
        }
        token.clear();
    }
}

const RESULT_TOKENS: [&str; 4] = ["1-0", "0-1", "1/2-1/2", "*"];

/// Accepts a movetext token iff it is a SAN move (castling included);
/// move-number prefixes and `!?` annotations are peeled off first, NAGs and
/// result tokens rejected.
fn san_token(token: &str) -> Option<SanPlus> {
    if token.starts_with('$') || RESULT_TOKENS.contains(&token) {
        return None;
    }
    // "1." / "1..." / fused "1.e4".
    let bare = token.trim_start_matches(|c: char| c.is_ascii_digit() || c == '.');
    let bare = bare.trim_end_matches(['!', '?']);
    if bare.is_empty() {
        return None;
    }
    bare.parse::<SanPlus>().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    fn stream(pgn: &str) -> PgnStream<Cursor<Vec<u8>>> {
        PgnStream::new(Cursor::new(pgn.as_bytes().to_vec()), GameFilter::default())
    }

    fn collect(mut s: PgnStream<Cursor<Vec<u8>>>) -> Vec<ParsedGame> {
        let mut games = vec![];
        while let Some(game) = s.next_game() {
            games.push(game.unwrap());
        }
        games
    }

    fn sans(game: &ParsedGame) -> Vec<String> {
        game.moves.iter().map(|san| san.to_string()).collect()
    }

    const SIMPLE: &str = "\
[Event \"Casual\"]\n[Result \"1-0\"]\n[WhiteElo \"2000\"]\n[BlackElo \"2201\"]\n\
[Date \"2019.05.01\"]\n\n1. e4 e5 2. Nf3 Nc6 3. Bb5 1-0\n";

    #[test]
    fn parses_a_simple_game() {
        let games = collect(stream(SIMPLE));
        assert_eq!(games.len(), 1);
        let game = &games[0];
        assert_eq!(sans(game), ["e4", "e5", "Nf3", "Nc6", "Bb5"]);
        assert_eq!(game.outcome, GameOutcome::WhiteWins);
        assert_eq!(game.average_rating, Some(2101));
        assert_eq!(game.event.as_deref(), Some("Casual"));
        assert_eq!(game.year, Some(2019));
    }

    #[test]
    fn strips_comments_variations_nags_and_numbers() {
        let pgn = "\
[Result \"0-1\"]\n\n\
1.e4 {king's pawn,\nspans lines} e5! 2... Nf3?! $14 (2. d4 (2. Nc3) exd4) Nc6 0-1\n";
        let games = collect(stream(pgn));
        assert_eq!(sans(&games[0]), ["e4", "e5", "Nf3", "Nc6"]);
        assert_eq!(games[0].outcome, GameOutcome::BlackWins);
        assert_eq!(games[0].average_rating, None);
    }

    #[test]
    fn castling_tokens_are_san() {
        let pgn = "[Result \"1/2-1/2\"]\n\n1. Nf3 Nf6 2. g3 g6 3. Bg2 Bg7 4. O-O O-O 1/2-1/2\n";
        let games = collect(stream(pgn));
        assert_eq!(sans(&games[0])[6..], ["O-O".to_string(), "O-O".to_string()]);
    }

    #[test]
    fn unknown_result_is_skipped() {
        let pgn = format!("[Result \"*\"]\n\n1. e4 *\n\n{SIMPLE}");
        let mut s = stream(&pgn);
        let games = {
            let mut games = vec![];
            while let Some(game) = s.next_game() {
                games.push(game.unwrap());
            }
            games
        };
        assert_eq!(games.len(), 1);
        assert_eq!(s.counts(), (1, 1));
    }

    #[test]
    fn last_game_without_trailing_blank_line() {
        let games = collect(stream("[Result \"1-0\"]\n\n1. d4 d5 1-0"));
        assert_eq!(sans(&games[0]), ["d4", "d5"]);
    }

    #[test]
    fn crlf_line_endings() {
        let pgn = "[Result \"1-0\"]\r\n\r\n1. e4 e5 1-0\r\n";
        let games = collect(stream(pgn));
        assert_eq!(sans(&games[0]), ["e4", "e5"]);
    }

    #[test]
    fn missing_blank_line_between_games() {
        let pgn = "[Result \"1-0\"]\n\n1. e4 e5 1-0\n[Result \"0-1\"]\n\n1. d4 0-1\n";
        let games = collect(stream(pgn));
        assert_eq!(games.len(), 2);
        assert_eq!(sans(&games[1]), ["d4"]);
    }

    #[test]
    fn empty_input_yields_nothing() {
        let mut s = stream("");
        assert!(s.next_game().is_none());
        assert_eq!(s.counts(), (0, 0));
    }

    #[test]
    fn rating_filter_skips_unrated_and_weak_games() {
        let filter = GameFilter { min_rating: Some(2050), ..GameFilter::default() };
        let pgn = format!(
            "{SIMPLE}\n[Result \"1-0\"]\n[WhiteElo \"1500\"]\n[BlackElo \"1500\"]\n\n1. e4 1-0\n\n\
             [Result \"1-0\"]\n\n1. d4 1-0\n"
        );
        let mut s = PgnStream::new(Cursor::new(pgn.into_bytes()), filter);
        let mut games = vec![];
        while let Some(game) = s.next_game() {
            games.push(game.unwrap());
        }
        assert_eq!(games.len(), 1);
        assert_eq!(games[0].average_rating, Some(2101));
        assert_eq!(s.counts(), (1, 2));
    }

    #[test]
    fn time_control_filter() {
        let filter =
            GameFilter { time_controls: Some(vec!["600+0".into()]), ..GameFilter::default() };
        let pgn = "[Result \"1-0\"]\n[TimeControl \"60+0\"]\n\n1. e4 1-0\n\n\
                   [Result \"1-0\"]\n[TimeControl \"600+0\"]\n\n1. d4 1-0\n";
        let mut s = PgnStream::new(Cursor::new(pgn.as_bytes().to_vec()), filter);
        let mut games = vec![];
        while let Some(game) = s.next_game() {
            games.push(game.unwrap());
        }
        assert_eq!(games.len(), 1);
        assert_eq!(sans(&games[0]), ["d4"]);
    }

    #[test]
    fn progress_hook_fires_on_schedule() {
        let calls = Arc::new(AtomicU64::new(0));
        let seen = Arc::clone(&calls);
        let mut pgn = String::new();
        for _ in 0..6 {
            pgn.push_str("[Result \"1-0\"]\n\n1. e4 1-0\n\n");
        }
        let mut s = PgnStream::new(Cursor::new(pgn.into_bytes()), GameFilter::default())
            .with_progress(2, move |parsed, skipped| {
                assert_eq!(skipped, 0);
                assert_eq!(parsed % 2, 0);
                seen.fetch_add(1, Ordering::Relaxed);
            });
        while let Some(game) = s.next_game() {
            game.unwrap();
        }
        assert_eq!(calls.load(Ordering::Relaxed), 3);
    }
}
