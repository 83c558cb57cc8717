use std::fmt::{self, Display, Formatter};

use derive_more::{BitXor, BitXorAssign};
use shakmaty::{
    Board, CastlingSide, Chess, Color, EnPassantMode, File, Move, Position, Role, Setup, Square,
    fen::Fen,
};

/// A 64-bit position hash. Covers piece placement, side to move, castling
/// rights, and the en-passant file; halfmove and fullmove counters never
/// contribute.
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, BitXor, BitXorAssign)]
#[must_use]
pub struct PosHash(pub u64);

impl Display for PosHash {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

pub const NUM_PIECE_SQUARE_KEYS: usize = 12 * 64;

/// The en-passant file is hashed whenever a target square is set, regardless
/// of whether a legal capture exists. `EnPassantMode::Always` reproduces the
/// FEN field for replayed positions.
pub const EP_MODE: EnPassantMode = EnPassantMode::Always;

pub struct ZobristTables {
    piece_square: [u64; NUM_PIECE_SQUARE_KEYS],
    black_to_move: u64,
    // White kingside, white queenside, black kingside, black queenside.
    castling: [u64; 4],
    ep_file: [u64; 8],
}

/// Plain xorshift64. Deliberately not a general-purpose RNG: the fixed seed
/// and fill order define the on-disk hash space, so both are frozen.
struct Xorshift64(u64);

impl Xorshift64 {
    const fn next(&mut self) -> u64 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.0 = x;
        x
    }
}

const SEED: u64 = 0x9e37_79b9_7f4a_7c15;

pub const ZOBRIST: ZobristTables = {
    let mut tables = ZobristTables {
        piece_square: [0; NUM_PIECE_SQUARE_KEYS],
        black_to_move: 0,
        castling: [0; 4],
        ep_file: [0; 8],
    };
    let mut rng = Xorshift64(SEED);
    let mut i = 0;
    while i < NUM_PIECE_SQUARE_KEYS {
        tables.piece_square[i] = rng.next();
        i += 1;
    }
    tables.black_to_move = rng.next();
    let mut i = 0;
    while i < 4 {
        tables.castling[i] = rng.next();
        i += 1;
    }
    let mut i = 0;
    while i < 8 {
        tables.ep_file[i] = rng.next();
        i += 1;
    }
    tables
};

fn role_index(role: Role) -> usize {
    match role {
        Role::Pawn => 0,
        Role::Knight => 1,
        Role::Bishop => 2,
        Role::Rook => 3,
        Role::Queen => 4,
        Role::King => 5,
    }
}

impl ZobristTables {
    #[must_use]
    pub fn piece_key(&self, color: Color, role: Role, square: Square) -> PosHash {
        let color_offset = match color {
            Color::White => 0,
            Color::Black => 6,
        };
        PosHash(self.piece_square[(color_offset + role_index(role)) * 64 + square as usize])
    }

    #[must_use]
    pub fn castle_key(&self, color: Color, side: CastlingSide) -> PosHash {
        let idx = match (color, side) {
            (Color::White, CastlingSide::KingSide) => 0,
            (Color::White, CastlingSide::QueenSide) => 1,
            (Color::Black, CastlingSide::KingSide) => 2,
            (Color::Black, CastlingSide::QueenSide) => 3,
        };
        PosHash(self.castling[idx])
    }

    #[must_use]
    pub fn ep_key(&self, file: File) -> PosHash {
        PosHash(self.ep_file[file as usize])
    }

    #[must_use]
    pub fn side_key(&self) -> PosHash {
        PosHash(self.black_to_move)
    }
}

fn hash_parts(board: &Board, turn: Color, rights: [bool; 4], ep_file: Option<File>) -> PosHash {
    let mut hash = PosHash::default();
    for square in board.occupied() {
        if let Some(piece) = board.piece_at(square) {
            hash ^= ZOBRIST.piece_key(piece.color, piece.role, square);
        }
    }
    if turn == Color::Black {
        hash ^= ZOBRIST.side_key();
    }
    let sides = [
        (Color::White, CastlingSide::KingSide),
        (Color::White, CastlingSide::QueenSide),
        (Color::Black, CastlingSide::KingSide),
        (Color::Black, CastlingSide::QueenSide),
    ];
    for (held, (color, side)) in rights.into_iter().zip(sides) {
        if held {
            hash ^= ZOBRIST.castle_key(color, side);
        }
    }
    if let Some(file) = ep_file {
        hash ^= ZOBRIST.ep_key(file);
    }
    hash
}

/// Hashes a raw setup, using only piece placement, side to move, castling
/// rights and the en-passant field. Works for EPD input (missing move
/// counters) and never inspects legality.
#[must_use]
pub fn hash_setup(setup: &Setup) -> PosHash {
    let rights = [
        setup.castling_rights.contains(Square::H1),
        setup.castling_rights.contains(Square::A1),
        setup.castling_rights.contains(Square::H8),
        setup.castling_rights.contains(Square::A8),
    ];
    hash_parts(&setup.board, setup.turn, rights, setup.ep_square.map(|sq| sq.file()))
}

/// Full recomputation for a legal position.
#[must_use]
pub fn hash_position(pos: &Chess) -> PosHash {
    let castles = pos.castles();
    let rights = [
        castles.has(Color::White, CastlingSide::KingSide),
        castles.has(Color::White, CastlingSide::QueenSide),
        castles.has(Color::Black, CastlingSide::KingSide),
        castles.has(Color::Black, CastlingSide::QueenSide),
    ];
    hash_parts(pos.board(), pos.turn(), rights, pos.ep_square(EP_MODE).map(|sq| sq.file()))
}

#[must_use]
pub fn hash_fen(fen: &Fen) -> PosHash {
    hash_setup(fen.as_setup())
}

/// XOR delta between the positions before and after a legal move, so that
/// `hash_position(before) ^ move_delta(before, m, after) == hash_position(after)`.
/// Covers piece movement, captures (including en passant), promotions,
/// castling rook movement, castling-right loss, en-passant file changes,
/// and the side-to-move toggle.
#[must_use]
pub fn move_delta(before: &Chess, mv: &Move, after: &Chess) -> PosHash {
    let us = before.turn();
    let them = !us;
    let mut delta = ZOBRIST.side_key();
    match *mv {
        Move::Normal { role, from, capture, to, promotion } => {
            delta ^= ZOBRIST.piece_key(us, role, from);
            delta ^= ZOBRIST.piece_key(us, promotion.unwrap_or(role), to);
            if let Some(captured) = capture {
                delta ^= ZOBRIST.piece_key(them, captured, to);
            }
        }
        Move::EnPassant { from, to } => {
            delta ^= ZOBRIST.piece_key(us, Role::Pawn, from);
            delta ^= ZOBRIST.piece_key(us, Role::Pawn, to);
            delta ^= ZOBRIST.piece_key(them, Role::Pawn, Square::from_coords(to.file(), from.rank()));
        }
        Move::Castle { king, rook } => {
            let side = if rook.file() > king.file() { CastlingSide::KingSide } else { CastlingSide::QueenSide };
            delta ^= ZOBRIST.piece_key(us, Role::King, king);
            delta ^= ZOBRIST.piece_key(us, Role::King, side.king_to(us));
            delta ^= ZOBRIST.piece_key(us, Role::Rook, rook);
            delta ^= ZOBRIST.piece_key(us, Role::Rook, side.rook_to(us));
        }
        // Drops don't exist in standard chess.
        Move::Put { .. } => {}
    }
    let before_castles = before.castles();
    let after_castles = after.castles();
    for color in [Color::White, Color::Black] {
        for side in [CastlingSide::KingSide, CastlingSide::QueenSide] {
            if before_castles.has(color, side) != after_castles.has(color, side) {
                delta ^= ZOBRIST.castle_key(color, side);
            }
        }
    }
    let old_ep = before.ep_square(EP_MODE).map(|sq| sq.file());
    let new_ep = after.ep_square(EP_MODE).map(|sq| sq.file());
    if old_ep != new_ep {
        if let Some(file) = old_ep {
            delta ^= ZOBRIST.ep_key(file);
        }
        if let Some(file) = new_ep {
            delta ^= ZOBRIST.ep_key(file);
        }
    }
    delta
}

#[cfg(test)]
mod tests {
    use super::*;
    use shakmaty::CastlingMode;
    use std::collections::HashSet;

    fn fen(s: &str) -> Fen {
        s.parse().unwrap()
    }

    fn position(s: &str) -> Chess {
        fen(s).into_position(CastlingMode::Standard).unwrap()
    }

    #[test]
    fn tables_have_no_degenerate_keys() {
        let mut seen = HashSet::new();
        for key in ZOBRIST.piece_square {
            assert_ne!(key, 0);
            assert!(seen.insert(key));
        }
        for key in ZOBRIST.castling.into_iter().chain(ZOBRIST.ep_file) {
            assert_ne!(key, 0);
            assert!(seen.insert(key));
        }
        assert!(seen.insert(ZOBRIST.black_to_move));
    }

    #[test]
    fn setup_and_position_hashes_agree() {
        for s in [
            "rnbqkbnr/pppppppp/8/8/8/8/PPPPPPPP/RNBQKBNR w KQkq - 0 1",
            "rnbqkbnr/pppppppp/8/8/4P3/8/PPPP1PPP/RNBQKBNR b KQkq - 0 1",
            "4r1k1/p4pp1/6bp/2p5/r2p4/P4PPP/1P2P3/2RRB1K1 w - - 1 15",
        ] {
            assert_eq!(hash_fen(&fen(s)), hash_position(&position(s)), "{s}");
        }
    }

    #[test]
    fn move_counters_do_not_hash() {
        let full = fen("rnbqkbnr/pppppppp/8/8/8/8/PPPPPPPP/RNBQKBNR w KQkq - 0 1");
        let epd = fen("rnbqkbnr/pppppppp/8/8/8/8/PPPPPPPP/RNBQKBNR w KQkq -");
        let other_counters = fen("rnbqkbnr/pppppppp/8/8/8/8/PPPPPPPP/RNBQKBNR w KQkq - 42 99");
        assert_eq!(hash_fen(&full), hash_fen(&epd));
        assert_eq!(hash_fen(&full), hash_fen(&other_counters));
    }

    #[test]
    fn en_passant_file_always_hashes() {
        // No black pawn can capture on e3, but the field is set, so it hashes.
        let with_ep = fen("rnbqkbnr/pppppppp/8/8/4P3/8/PPPP1PPP/RNBQKBNR b KQkq e3 0 1");
        let without = fen("rnbqkbnr/pppppppp/8/8/4P3/8/PPPP1PPP/RNBQKBNR b KQkq - 0 1");
        assert_ne!(hash_fen(&with_ep), hash_fen(&without));
        assert_eq!(hash_fen(&with_ep), hash_fen(&without) ^ ZOBRIST.ep_key(File::E));
    }

    #[test]
    fn castling_rights_hash_independently() {
        let all = fen("rnbqkbnr/pppppppp/8/8/8/8/PPPPPPPP/RNBQKBNR w KQkq - 0 1");
        let no_white_king = fen("rnbqkbnr/pppppppp/8/8/8/8/PPPPPPPP/RNBQKBNR w Qkq - 0 1");
        let none = fen("rnbqkbnr/pppppppp/8/8/8/8/PPPPPPPP/RNBQKBNR w - - 0 1");
        assert_eq!(
            hash_fen(&all),
            hash_fen(&no_white_king) ^ ZOBRIST.castle_key(Color::White, CastlingSide::KingSide)
        );
        let mut expected = hash_fen(&none);
        expected ^= ZOBRIST.castle_key(Color::White, CastlingSide::KingSide);
        expected ^= ZOBRIST.castle_key(Color::White, CastlingSide::QueenSide);
        expected ^= ZOBRIST.castle_key(Color::Black, CastlingSide::KingSide);
        expected ^= ZOBRIST.castle_key(Color::Black, CastlingSide::QueenSide);
        assert_eq!(hash_fen(&all), expected);
    }

    #[test]
    fn common_openings_hash_pairwise_distinct() {
        let fens = [
            "rnbqkbnr/pppppppp/8/8/8/8/PPPPPPPP/RNBQKBNR w KQkq - 0 1",
            "rnbqkbnr/pppppppp/8/8/4P3/8/PPPP1PPP/RNBQKBNR b KQkq e3 0 1",
            "rnbqkbnr/pppp1ppp/8/4p3/4P3/8/PPPP1PPP/RNBQKBNR w KQkq e6 0 2",
            "rnbqkbnr/pppp1ppp/8/4p3/4P3/5N2/PPPP1PPP/RNBQKB1R b KQkq - 1 2",
            "r1bqkbnr/pppp1ppp/2n5/4p3/4P3/5N2/PPPP1PPP/RNBQKB1R w KQkq - 2 3",
            "r1bqkbnr/pppp1ppp/2n5/1B2p3/4P3/5N2/PPPP1PPP/RNBQK2R b KQkq - 3 3",
            "rnbqkbnr/pppppppp/8/8/3P4/8/PPP1PPPP/RNBQKBNR b KQkq d3 0 1",
            "rnbqkbnr/ppp1pppp/8/3p4/3P4/8/PPP1PPPP/RNBQKBNR w KQkq d6 0 2",
            "rnbqkbnr/ppp1pppp/8/3p4/2PP4/8/PP2PPPP/RNBQKBNR b KQkq c3 0 2",
            "rnbqkbnr/pp1ppppp/8/2p5/4P3/8/PPPP1PPP/RNBQKBNR w KQkq c6 0 2",
            "rnbqkbnr/pp1ppppp/8/2p5/4P3/5N2/PPPP1PPP/RNBQKB1R b KQkq - 1 2",
            "rnbqkb1r/pppppppp/5n2/8/3P4/8/PPP1PPPP/RNBQKBNR w KQkq - 1 2",
        ];
        let hashes: HashSet<_> = fens.iter().map(|s| hash_fen(&fen(s))).collect();
        assert_eq!(hashes.len(), fens.len());
    }

    #[test]
    fn delta_matches_recomputation_through_full_games() {
        // Between them: captures, both castlings, double pushes, promotion,
        // and castling-right loss.
        let games: [&[&str]; 2] = [
            &[
                "e4", "e5", "Nf3", "Nc6", "Bb5", "a6", "Ba4", "Nf6", "O-O", "Be7", "Re1", "b5",
                "Bb3", "O-O", "c3", "d5", "exd5", "Nxd5", "Nxe5", "Nxe5", "Rxe5", "c6", "d4",
                "Bd6", "Re1", "Qh4", "g3", "Qh3",
            ],
            &[
                "e4", "d5", "exd5", "c6", "dxc6", "Nf6", "cxb7", "Nbd7", "bxa8=Q", "g6", "Nf3",
                "Bg7", "Be2", "O-O",
            ],
        ];
        for sans in games {
            let mut pos = Chess::default();
            for san in sans {
                let mv = san
                    .parse::<shakmaty::san::San>()
                    .unwrap()
                    .to_move(&pos)
                    .unwrap();
                let mut after = pos.clone();
                after.play_unchecked(mv.clone());
                assert_eq!(
                    hash_position(&pos) ^ move_delta(&pos, &mv, &after),
                    hash_position(&after),
                    "after {san}"
                );
                pos = after;
            }
        }
    }

    #[test]
    fn delta_handles_double_push_and_en_passant() {
        let pos = position("rnbqkbnr/ppp1pppp/8/8/3pP3/8/PPPP1PP1/RNBQKBNR b KQkq e3 0 3");
        let mv = "dxe3"
            .parse::<shakmaty::san::San>()
            .unwrap()
            .to_move(&pos)
            .unwrap();
        let mut after = pos.clone();
        after.play_unchecked(mv.clone());
        assert_eq!(hash_position(&pos) ^ move_delta(&pos, &mv, &after), hash_position(&after));
    }
}
