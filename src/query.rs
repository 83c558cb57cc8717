use itertools::Itertools;
use serde::Serialize;
use shakmaty::san::SanPlus;
use shakmaty::uci::UciMove;
use shakmaty::{CastlingMode, Chess, FromSetup, Position, Setup, fen::Fen};

use crate::model::PositionStats;
use crate::openings::{Opening, Openings};
use crate::store::{ReadStore, StoreResult};
use crate::zobrist::{EP_MODE, hash_setup};

pub const DEFAULT_QUERY_LIMIT: usize = 12;

#[derive(Debug, Clone, Copy)]
pub struct QueryOptions {
    /// Maximum number of moves returned.
    pub limit: usize,
}

impl Default for QueryOptions {
    fn default() -> Self {
        QueryOptions { limit: DEFAULT_QUERY_LIMIT }
    }
}

/// Win/draw/loss breakdown with derived percentages.
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplyStats {
    pub total_games: u64,
    pub white_win_percent: f64,
    pub draw_percent: f64,
    pub black_win_percent: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExplorerMoveReply {
    pub uci: String,
    pub san: String,
    pub white: u32,
    pub draws: u32,
    pub black: u32,
    pub average_rating: u32,
    pub total_games: u32,
    /// Share of the position's games that played this move, in percent.
    pub play_rate: f64,
    pub white_win_percent: f64,
    pub draw_percent: f64,
    pub black_win_percent: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub opening: Option<Opening>,
}

/// Query result. The raw fields (`white`, `draws`, `black`, `moves`,
/// `topGames`, `opening`) serialize bit-compatibly with the Lichess opening
/// explorer response; `stats`, the per-move percentages and the `database`
/// marker are local additions. `topGames` is always empty for this backend,
/// keeping the schema stable for clients.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExplorerReply {
    pub white: u32,
    pub draws: u32,
    pub black: u32,
    pub moves: Vec<ExplorerMoveReply>,
    pub top_games: Vec<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub opening: Option<Opening>,
    pub stats: ReplyStats,
    pub database: &'static str,
}

fn percent(part: u32, total: u64) -> f64 {
    if total == 0 { 0.0 } else { 100.0 * f64::from(part) / total as f64 }
}

fn epd_string(setup: &Setup) -> String {
    Fen::try_from_setup(setup.clone())
        .unwrap_or_else(|e| e.ignore())
        .to_string()
        .split_whitespace()
        .take(4)
        .join(" ")
}

/// Point queries against a compacted store, with optional opening names.
/// Holds no mutable state; share one per process.
pub struct Explorer<'a, R> {
    store: &'a R,
    openings: Option<&'a Openings>,
}

impl<'a, R: ReadStore> Explorer<'a, R> {
    #[must_use]
    pub fn new(store: &'a R) -> Explorer<'a, R> {
        Explorer { store, openings: None }
    }

    #[must_use]
    pub fn with_openings(mut self, openings: &'a Openings) -> Explorer<'a, R> {
        self.openings = Some(openings);
        self
    }

    fn empty_reply(&self) -> ExplorerReply {
        ExplorerReply {
            white: 0,
            draws: 0,
            black: 0,
            moves: vec![],
            top_games: vec![],
            opening: None,
            stats: ReplyStats {
                total_games: 0,
                white_win_percent: 0.0,
                draw_percent: 0.0,
                black_win_percent: 0.0,
            },
            database: "local",
        }
    }

    /// Whether the exact position is present in the store; lets callers
    /// distinguish "not indexed" from a position with zero recorded games.
    pub fn has_position(&self, fen: &str) -> StoreResult<bool> {
        match fen.trim().parse::<Fen>() {
            Ok(fen) => self.store.has_position(hash_setup(fen.as_setup())),
            Err(_) => Ok(false),
        }
    }

    /// Aggregated statistics for a FEN. Only the first four FEN fields
    /// matter, so EPD input works. A malformed FEN yields the empty reply,
    /// never an error; store faults propagate.
    pub fn query(&self, fen: &str, options: &QueryOptions) -> StoreResult<ExplorerReply> {
        let Ok(fen) = fen.trim().parse::<Fen>() else {
            return Ok(self.empty_reply());
        };
        let setup = fen.into_setup();
        let hash = hash_setup(&setup);
        let Some(position) = self.store.get_position(hash)? else {
            return Ok(self.empty_reply());
        };
        let total = position.total();
        if total == 0 {
            return Ok(self.empty_reply());
        }
        let moves = self.store.get_moves(hash)?;
        // SAN conversion needs a playable position; statistics do not.
        let pos = Chess::from_setup(setup.clone(), CastlingMode::Standard).ok();
        let moves = moves
            .into_iter()
            .take(options.limit)
            .filter_map(|stats| {
                let pos = pos.as_ref()?;
                let uci = UciMove::from_ascii(stats.uci.as_bytes()).ok()?;
                let mv = uci.to_move(pos).ok()?;
                let mut pos_after = pos.clone();
                let san = SanPlus::from_move_and_play_unchecked(&mut pos_after, mv);
                let opening = self
                    .openings
                    .and_then(|openings| {
                        openings.classify(&epd_string(&pos_after.to_setup(EP_MODE)))
                    })
                    .cloned();
                Some(ExplorerMoveReply {
                    uci: stats.uci.to_string(),
                    san: san.to_string(),
                    white: stats.white,
                    draws: stats.draws,
                    black: stats.black,
                    average_rating: stats.average_rating(),
                    total_games: stats.total(),
                    play_rate: percent(stats.total(), total),
                    white_win_percent: percent(stats.white, u64::from(stats.games)),
                    draw_percent: percent(stats.draws, u64::from(stats.games)),
                    black_win_percent: percent(stats.black, u64::from(stats.games)),
                    opening,
                })
            })
            .collect();
        Ok(self.reply_for(position, moves, &setup))
    }

    fn reply_for(
        &self,
        position: PositionStats,
        moves: Vec<ExplorerMoveReply>,
        setup: &Setup,
    ) -> ExplorerReply {
        let total = position.total();
        let opening =
            self.openings.and_then(|openings| openings.classify(&epd_string(setup))).cloned();
        ExplorerReply {
            white: position.white,
            draws: position.draws,
            black: position.black,
            moves,
            top_games: vec![],
            opening,
            stats: ReplyStats {
                total_games: total,
                white_win_percent: percent(position.white, total),
                draw_percent: percent(position.draws, total),
                black_win_percent: percent(position.black, total),
            },
            database: "local",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::GameOutcome;
    use crate::pgn::ParsedGame;
    use crate::replay::{DEFAULT_MAX_PLIES, replay};
    use crate::store::{MemStore, WriteStore};

    const START: &str = "rnbqkbnr/pppppppp/8/8/8/8/PPPPPPPP/RNBQKBNR w KQkq - 0 1";
    const AFTER_E4: &str = "rnbqkbnr/pppppppp/8/8/4P3/8/PPPP1PPP/RNBQKBNR b KQkq e3 0 1";

    fn index_game(store: &mut MemStore, sans: &[&str], outcome: GameOutcome, rating: Option<u32>) {
        let game = ParsedGame {
            moves: sans.iter().map(|san| san.parse().unwrap()).collect(),
            outcome,
            average_rating: rating,
            event: None,
            year: None,
        };
        store.batch_write(&replay(&game, DEFAULT_MAX_PLIES)).unwrap();
    }

    #[test]
    fn single_game_round_trip() {
        let mut store = MemStore::new();
        index_game(
            &mut store,
            &["e4", "e5", "Nf3", "Nc6", "Bb5"],
            GameOutcome::WhiteWins,
            Some(2100),
        );
        let explorer = Explorer::new(&store);
        let reply = explorer.query(START, &QueryOptions::default()).unwrap();
        assert_eq!((reply.white, reply.draws, reply.black), (1, 0, 0));
        assert_eq!(reply.stats.total_games, 1);
        assert_eq!(reply.moves.len(), 1);
        let mv = &reply.moves[0];
        assert_eq!(mv.san, "e4");
        assert_eq!(mv.uci, "e2e4");
        assert_eq!(mv.total_games, 1);
        assert_eq!(mv.white_win_percent, 100.0);
        assert_eq!(mv.play_rate, 100.0);
        assert_eq!(mv.average_rating, 2100);
        assert_eq!(reply.database, "local");
        assert!(explorer.has_position(START).unwrap());
        assert!(!explorer.has_position("8/8/8/8/8/8/8/8 w - - 0 1").unwrap());
    }

    #[test]
    fn draws_and_losses_split_between_two_moves() {
        let mut store = MemStore::new();
        for _ in 0..50 {
            index_game(&mut store, &["e4", "e5"], GameOutcome::Draw, None);
            index_game(&mut store, &["d4", "d5"], GameOutcome::BlackWins, None);
        }
        let reply = Explorer::new(&store).query(START, &QueryOptions::default()).unwrap();
        assert_eq!((reply.white, reply.draws, reply.black), (0, 50, 50));
        assert_eq!(reply.stats.total_games, 100);
        assert_eq!(reply.moves.len(), 2);
        for mv in &reply.moves {
            assert_eq!(mv.play_rate, 50.0);
            assert_eq!(mv.total_games, 50);
        }
        assert_eq!(reply.stats.draw_percent, 50.0);
        assert_eq!(reply.stats.black_win_percent, 50.0);
    }

    #[test]
    fn malformed_fen_yields_the_empty_reply() {
        let store = MemStore::new();
        let reply = Explorer::new(&store).query("not a fen", &QueryOptions::default()).unwrap();
        assert_eq!(reply.stats.total_games, 0);
        assert!(reply.moves.is_empty());
        assert_eq!(reply.database, "local");
    }

    #[test]
    fn unindexed_position_yields_the_empty_reply() {
        let store = MemStore::new();
        let reply = Explorer::new(&store).query(START, &QueryOptions::default()).unwrap();
        assert_eq!(reply.stats.total_games, 0);
        assert!(reply.moves.is_empty());
    }

    #[test]
    fn epd_input_works() {
        let mut store = MemStore::new();
        index_game(&mut store, &["e4"], GameOutcome::WhiteWins, None);
        let epd = "rnbqkbnr/pppppppp/8/8/8/8/PPPPPPPP/RNBQKBNR w KQkq -";
        let reply = Explorer::new(&store).query(epd, &QueryOptions::default()).unwrap();
        assert_eq!(reply.stats.total_games, 1);
        assert_eq!(reply.moves.len(), 1);
    }

    #[test]
    fn limit_truncates_moves() {
        let mut store = MemStore::new();
        index_game(&mut store, &["e4"], GameOutcome::WhiteWins, None);
        index_game(&mut store, &["e4"], GameOutcome::WhiteWins, None);
        index_game(&mut store, &["d4"], GameOutcome::Draw, None);
        index_game(&mut store, &["c4"], GameOutcome::BlackWins, None);
        let reply =
            Explorer::new(&store).query(START, &QueryOptions { limit: 2 }).unwrap();
        assert_eq!(reply.moves.len(), 2);
        assert_eq!(reply.moves[0].uci, "e2e4");
    }

    #[test]
    fn opening_names_attach_to_position_and_moves() {
        let table = "B00\tKing's Pawn Game\trnbqkbnr/pppppppp/8/8/4P3/8/PPPP1PPP/RNBQKBNR b KQkq e3\n";
        let openings = Openings::from_tsv_reader(table.as_bytes()).unwrap();
        let mut store = MemStore::new();
        index_game(&mut store, &["e4", "e5"], GameOutcome::Draw, None);
        let explorer = Explorer::new(&store).with_openings(&openings);

        let start_reply = explorer.query(START, &QueryOptions::default()).unwrap();
        assert!(start_reply.opening.is_none());
        let mv = &start_reply.moves[0];
        assert_eq!(mv.opening.as_ref().unwrap().eco, "B00");

        let after_e4 = explorer.query(AFTER_E4, &QueryOptions::default()).unwrap();
        let opening = after_e4.opening.unwrap();
        assert_eq!(opening.eco, "B00");
        assert_eq!(opening.name, "King's Pawn Game");
    }

    #[test]
    fn reply_serializes_to_the_lichess_field_names() {
        let mut store = MemStore::new();
        index_game(&mut store, &["e4"], GameOutcome::WhiteWins, Some(1999));
        let reply = Explorer::new(&store).query(START, &QueryOptions::default()).unwrap();
        let json = serde_json::to_value(&reply).unwrap();
        assert_eq!(json["white"], 1);
        assert_eq!(json["topGames"], serde_json::json!([]));
        assert_eq!(json["database"], "local");
        assert_eq!(json["stats"]["totalGames"], 1);
        assert_eq!(json["stats"]["whiteWinPercent"], 100.0);
        let mv = &json["moves"][0];
        assert_eq!(mv["uci"], "e2e4");
        assert_eq!(mv["san"], "e4");
        assert_eq!(mv["averageRating"], 1999);
        assert_eq!(mv["playRate"], 100.0);
        assert_eq!(mv["totalGames"], 1);
        assert!(mv.get("opening").is_none());
    }
}
