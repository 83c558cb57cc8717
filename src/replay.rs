use shakmaty::{CastlingMode, Chess, Position};

use crate::model::{PositionUpdate, UciString};
use crate::pgn::ParsedGame;
use crate::zobrist::{hash_position, move_delta};

/// Opening statistics past move 20 add little value relative to index
/// growth, so replay stops there by default.
pub const DEFAULT_MAX_PLIES: usize = 40;

/// Replays a game from the standard initial position, emitting one update
/// per ply: the hash of the position *before* the move, the resolved UCI,
/// the game outcome, and the game's average rating.
///
/// SAN resolution doubles as the legality check; the first move that fails
/// to resolve ends the replay and the prefix already emitted is kept. Plies
/// beyond `max_plies` are not replayed.
#[must_use]
pub fn replay(game: &ParsedGame, max_plies: usize) -> Vec<PositionUpdate> {
    let mut updates = Vec::with_capacity(game.moves.len().min(max_plies));
    let mut pos = Chess::default();
    let mut hash = hash_position(&pos);
    for san in game.moves.iter().take(max_plies) {
        let Ok(mv) = san.san.to_move(&pos) else {
            break;
        };
        let uci = mv.to_uci(CastlingMode::Standard).to_string();
        let Ok(uci) = UciString::from(&uci) else {
            break;
        };
        updates.push(PositionUpdate {
            hash,
            uci,
            outcome: game.outcome,
            rating: game.average_rating,
        });
        let mut after = pos.clone();
        after.play_unchecked(mv.clone());
        hash ^= move_delta(&pos, &mv, &after);
        pos = after;
    }
    updates
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::GameOutcome;
    use crate::zobrist::hash_fen;
    use shakmaty::fen::Fen;
    use shakmaty::san::SanPlus;

    fn game(sans: &[&str], outcome: GameOutcome, rating: Option<u32>) -> ParsedGame {
        ParsedGame {
            moves: sans.iter().map(|san| san.parse::<SanPlus>().unwrap()).collect(),
            outcome,
            average_rating: rating,
            event: None,
            year: None,
        }
    }

    const START: &str = "rnbqkbnr/pppppppp/8/8/8/8/PPPPPPPP/RNBQKBNR w KQkq - 0 1";
    const AFTER_E4: &str = "rnbqkbnr/pppppppp/8/8/4P3/8/PPPP1PPP/RNBQKBNR b KQkq e3 0 1";

    #[test]
    fn emits_hash_of_the_position_before_each_move() {
        let game = game(&["e4", "e5", "Nf3"], GameOutcome::WhiteWins, Some(2100));
        let updates = replay(&game, DEFAULT_MAX_PLIES);
        assert_eq!(updates.len(), 3);
        assert_eq!(updates[0].hash, hash_fen(&START.parse::<Fen>().unwrap()));
        assert_eq!(updates[0].uci.as_str(), "e2e4");
        assert_eq!(updates[1].hash, hash_fen(&AFTER_E4.parse::<Fen>().unwrap()));
        assert_eq!(updates[1].uci.as_str(), "e7e5");
        for update in &updates {
            assert_eq!(update.outcome, GameOutcome::WhiteWins);
            assert_eq!(update.rating, Some(2100));
        }
    }

    #[test]
    fn illegal_move_keeps_the_prefix() {
        let game = game(&["e4", "e5", "Qxf7", "Nc6"], GameOutcome::Draw, None);
        let updates = replay(&game, DEFAULT_MAX_PLIES);
        assert_eq!(updates.len(), 2);
        assert_eq!(updates[1].uci.as_str(), "e7e5");
    }

    #[test]
    fn plies_beyond_the_cap_are_skipped() {
        let game = game(&["e4", "e5", "Nf3", "Nc6", "Bb5"], GameOutcome::WhiteWins, None);
        assert_eq!(replay(&game, 2).len(), 2);
        assert_eq!(replay(&game, 0).len(), 0);
    }

    #[test]
    fn zero_move_game_emits_nothing() {
        let game = game(&[], GameOutcome::Draw, None);
        assert!(replay(&game, DEFAULT_MAX_PLIES).is_empty());
    }

    #[test]
    fn castling_and_promotion_resolve_to_uci() {
        let sans =
            ["e4", "d5", "exd5", "c6", "dxc6", "Nf6", "cxb7", "Nbd7", "bxa8=Q", "g6", "Nf3", "Bg7",
             "Be2", "O-O"];
        let game = game(&sans, GameOutcome::WhiteWins, None);
        let updates = replay(&game, DEFAULT_MAX_PLIES);
        assert_eq!(updates.len(), sans.len());
        assert_eq!(updates[8].uci.as_str(), "b7a8q");
        assert_eq!(updates[13].uci.as_str(), "e8g8");
    }
}
