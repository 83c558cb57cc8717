use arrayvec::{ArrayString, ArrayVec};
use byteorder::{ByteOrder, LittleEndian};
use static_assertions::const_assert_eq;

use crate::zobrist::PosHash;

/// A UCI move is at most 5 ASCII bytes: from-square, to-square, optional
/// promotion letter.
pub type UciString = ArrayString<5>;

pub const POSITION_KEY_LEN: usize = 10;
pub const MAX_MOVE_KEY_LEN: usize = 16;
pub const POSITION_VALUE_LEN: usize = 12;
pub const MOVE_VALUE_LEN: usize = 24;

const_assert_eq!(POSITION_VALUE_LEN, 3 * 4);
const_assert_eq!(MOVE_VALUE_LEN, 3 * 4 + 8 + 4);
const_assert_eq!(MAX_MOVE_KEY_LEN, 2 + 8 + 1 + 5);

pub type KeyBuf = ArrayVec<u8, MAX_MOVE_KEY_LEN>;

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
#[must_use]
pub enum GameOutcome {
    WhiteWins,
    BlackWins,
    Draw,
}

/// One observation from replay: the position (hashed before the move), the
/// move played from it, how the game eventually ended, and the game's
/// average rating if it had one.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct PositionUpdate {
    pub hash: PosHash,
    pub uci: UciString,
    pub outcome: GameOutcome,
    pub rating: Option<u32>,
}

/// Aggregated outcomes of all games that reached a position.
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub struct PositionStats {
    pub white: u32,
    pub draws: u32,
    pub black: u32,
}

impl PositionStats {
    #[must_use]
    pub fn total(&self) -> u64 {
        u64::from(self.white) + u64::from(self.draws) + u64::from(self.black)
    }

    pub fn record(&mut self, outcome: GameOutcome) {
        match outcome {
            GameOutcome::WhiteWins => self.white += 1,
            GameOutcome::Draw => self.draws += 1,
            GameOutcome::BlackWins => self.black += 1,
        }
    }

    pub fn merge(&mut self, other: &PositionStats) {
        self.white += other.white;
        self.draws += other.draws;
        self.black += other.black;
    }

    #[must_use]
    pub fn encode(&self) -> [u8; POSITION_VALUE_LEN] {
        let mut buf = [0; POSITION_VALUE_LEN];
        LittleEndian::write_u32(&mut buf[0..4], self.white);
        LittleEndian::write_u32(&mut buf[4..8], self.draws);
        LittleEndian::write_u32(&mut buf[8..12], self.black);
        buf
    }

    #[must_use]
    pub fn decode(bytes: &[u8]) -> Option<PositionStats> {
        if bytes.len() != POSITION_VALUE_LEN {
            return None;
        }
        Some(PositionStats {
            white: LittleEndian::read_u32(&bytes[0..4]),
            draws: LittleEndian::read_u32(&bytes[4..8]),
            black: LittleEndian::read_u32(&bytes[8..12]),
        })
    }
}

/// Aggregated outcomes of all games that played one particular move from a
/// position. `games` always equals `white + draws + black`; `rating_sum`
/// accumulates the average rating of every rated game.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct MoveStats {
    pub uci: UciString,
    pub white: u32,
    pub draws: u32,
    pub black: u32,
    pub rating_sum: u64,
    pub games: u32,
}

impl MoveStats {
    #[must_use]
    pub fn new(uci: UciString) -> MoveStats {
        MoveStats { uci, white: 0, draws: 0, black: 0, rating_sum: 0, games: 0 }
    }

    #[must_use]
    pub fn total(&self) -> u32 {
        self.games
    }

    pub fn record(&mut self, outcome: GameOutcome, rating: Option<u32>) {
        match outcome {
            GameOutcome::WhiteWins => self.white += 1,
            GameOutcome::Draw => self.draws += 1,
            GameOutcome::BlackWins => self.black += 1,
        }
        self.games += 1;
        if let Some(rating) = rating {
            self.rating_sum += u64::from(rating);
        }
    }

    pub fn merge(&mut self, other: &MoveStats) {
        debug_assert_eq!(self.uci, other.uci);
        self.white += other.white;
        self.draws += other.draws;
        self.black += other.black;
        self.rating_sum += other.rating_sum;
        self.games += other.games;
    }

    /// Mean rating of the games that played this move, 0 when unknown.
    #[must_use]
    pub fn average_rating(&self) -> u32 {
        if self.games > 0 { (self.rating_sum / u64::from(self.games)) as u32 } else { 0 }
    }

    #[must_use]
    pub fn encode(&self) -> [u8; MOVE_VALUE_LEN] {
        let mut buf = [0; MOVE_VALUE_LEN];
        LittleEndian::write_u32(&mut buf[0..4], self.white);
        LittleEndian::write_u32(&mut buf[4..8], self.draws);
        LittleEndian::write_u32(&mut buf[8..12], self.black);
        LittleEndian::write_u64(&mut buf[12..20], self.rating_sum);
        LittleEndian::write_u32(&mut buf[20..24], self.games);
        buf
    }

    #[must_use]
    pub fn decode(uci: UciString, bytes: &[u8]) -> Option<MoveStats> {
        if bytes.len() != MOVE_VALUE_LEN {
            return None;
        }
        Some(MoveStats {
            uci,
            white: LittleEndian::read_u32(&bytes[0..4]),
            draws: LittleEndian::read_u32(&bytes[4..8]),
            black: LittleEndian::read_u32(&bytes[8..12]),
            rating_sum: LittleEndian::read_u64(&bytes[12..20]),
            games: LittleEndian::read_u32(&bytes[20..24]),
        })
    }
}

/// `"p:" ++ hash` big-endian, so hashes sort numerically under byte order.
#[must_use]
pub fn position_key(hash: PosHash) -> KeyBuf {
    let mut key = KeyBuf::new();
    key.extend(*b"p:");
    key.extend(hash.0.to_be_bytes());
    key
}

/// `"m:" ++ hash ++ ":" ++ uci`. All moves of one position share the
/// 11-byte prefix and therefore sort contiguously.
#[must_use]
pub fn move_key(hash: PosHash, uci: &str) -> KeyBuf {
    let mut key = KeyBuf::new();
    key.extend(*b"m:");
    key.extend(hash.0.to_be_bytes());
    key.push(b':');
    key.extend(uci.bytes().take(5));
    key
}

/// Half-open key range `[m:H:, m:H;)` covering every move of a position.
#[must_use]
pub fn move_key_range(hash: PosHash) -> (KeyBuf, KeyBuf) {
    let start = move_key(hash, "");
    let mut end = start.clone();
    end[POSITION_KEY_LEN] = b':' + 1;
    (start, end)
}

#[must_use]
pub fn parse_position_key(key: &[u8]) -> Option<PosHash> {
    if key.len() != POSITION_KEY_LEN || !key.starts_with(b"p:") {
        return None;
    }
    let mut hash = [0; 8];
    hash.copy_from_slice(&key[2..10]);
    Some(PosHash(u64::from_be_bytes(hash)))
}

#[must_use]
pub fn parse_move_key(key: &[u8]) -> Option<(PosHash, UciString)> {
    if key.len() < POSITION_KEY_LEN + 2 || !key.starts_with(b"m:") || key[POSITION_KEY_LEN] != b':'
    {
        return None;
    }
    let mut hash = [0; 8];
    hash.copy_from_slice(&key[2..10]);
    let uci = std::str::from_utf8(&key[POSITION_KEY_LEN + 1..]).ok()?;
    Some((PosHash(u64::from_be_bytes(hash)), UciString::from(uci).ok()?))
}
