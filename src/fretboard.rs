//! Where a pitch lights up: a key on the piano, a (string, fret) cell on the guitar.
//!
//! The guitar solver prefers the lowest fret. For standard tuning that means an open
//! string when there is one, otherwise the string that keeps the hand nearest the nut.

use std::collections::BTreeSet;

/// Standard tuning, high E to low E, as MIDI note numbers.
pub const STRING_TUNING: [i32; 6] = [64, 59, 55, 50, 45, 40];
pub const STRING_NAMES: [&str; 6] = ["E", "B", "G", "D", "A", "E"];
pub const FRETS: u8 = 24;

pub const PIANO_LOW: u8 = 36;
pub const PIANO_HIGH: u8 = 84;
const PIANO_KEYS: usize = (PIANO_HIGH - PIANO_LOW + 1) as usize;

/// Fret markers (double dots at 12 and 24).
pub const INLAYS: [u8; 10] = [3, 5, 7, 9, 12, 15, 17, 19, 21, 24];

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FretPosition {
    /// 0 = high E … 5 = low E
    pub string: u8,
    pub fret: u8,
}

impl FretPosition {
    pub fn pitch(&self) -> i32 {
        STRING_TUNING[self.string as usize] + self.fret as i32
    }
}

/// Lowest-fret position for `pitch`, or `None` if no string reaches it.
/// On equal frets the higher string wins.
pub fn solve_guitar(pitch: i32) -> Option<FretPosition> {
    let mut best: Option<FretPosition> = None;
    for (s, open) in STRING_TUNING.iter().enumerate() {
        let fret = pitch - open;
        if !(0..=FRETS as i32).contains(&fret) {
            continue;
        }
        if best.is_none_or(|b| (fret as u8) < b.fret) {
            best = Some(FretPosition { string: s as u8, fret: fret as u8 });
        }
    }
    best
}

/// Key id for pitches on the visual keyboard.
pub fn piano_key(pitch: i32) -> Option<u8> {
    if (PIANO_LOW as i32..=PIANO_HIGH as i32).contains(&pitch) {
        Some(pitch as u8)
    } else {
        None
    }
}

pub fn is_black_key(pitch: u8) -> bool {
    matches!(pitch % 12, 1 | 3 | 6 | 8 | 10)
}

/// Lit state of every key from `PIANO_LOW` to `PIANO_HIGH`.
#[derive(Clone, Debug)]
pub struct PianoView {
    lit: [bool; PIANO_KEYS],
}

impl Default for PianoView {
    fn default() -> Self {
        Self { lit: [false; PIANO_KEYS] }
    }
}

impl PianoView {
    /// Light exactly the keys in `active`. Returns how many keys changed.
    pub fn reconcile(&mut self, active: &BTreeSet<i32>) -> usize {
        let wanted: BTreeSet<u8> = active.iter().filter_map(|&p| piano_key(p)).collect();
        let mut changed = 0;
        for (i, lit) in self.lit.iter_mut().enumerate() {
            let on = wanted.contains(&(PIANO_LOW + i as u8));
            if *lit != on {
                *lit = on;
                changed += 1;
            }
        }
        changed
    }

    pub fn clear(&mut self) -> usize {
        self.reconcile(&BTreeSet::new())
    }

    pub fn is_lit(&self, key: u8) -> bool {
        key.checked_sub(PIANO_LOW)
            .and_then(|i| self.lit.get(i as usize))
            .copied()
            .unwrap_or(false)
    }

    pub fn lit_keys(&self) -> BTreeSet<u8> {
        (PIANO_LOW..=PIANO_HIGH).filter(|&k| self.is_lit(k)).collect()
    }
}

/// Lit state of every (string, fret) cell.
#[derive(Clone, Debug, Default)]
pub struct FretboardView {
    lit: [[bool; FRETS as usize + 1]; 6],
}

impl FretboardView {
    /// Light exactly the positions solved from `active`. Returns how many cells changed.
    pub fn reconcile(&mut self, active: &BTreeSet<i32>) -> usize {
        let wanted: BTreeSet<FretPosition> = active.iter().filter_map(|&p| solve_guitar(p)).collect();
        let mut changed = 0;
        for (s, row) in self.lit.iter_mut().enumerate() {
            for (f, lit) in row.iter_mut().enumerate() {
                let on = wanted.contains(&FretPosition { string: s as u8, fret: f as u8 });
                if *lit != on {
                    *lit = on;
                    changed += 1;
                }
            }
        }
        changed
    }

    pub fn clear(&mut self) -> usize {
        self.reconcile(&BTreeSet::new())
    }

    pub fn is_lit(&self, pos: FretPosition) -> bool {
        self.lit
            .get(pos.string as usize)
            .and_then(|row| row.get(pos.fret as usize))
            .copied()
            .unwrap_or(false)
    }

    pub fn lit_positions(&self) -> BTreeSet<FretPosition> {
        let mut out = BTreeSet::new();
        for (s, row) in self.lit.iter().enumerate() {
            for (f, &lit) in row.iter().enumerate() {
                if lit {
                    out.insert(FretPosition { string: s as u8, fret: f as u8 });
                }
            }
        }
        out
    }
}
