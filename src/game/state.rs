//! Pure elimination-game rules. No Discord types beyond IDs, no clocks, no
//! I/O - randomness is injected so every transition is unit-testable.

use rand::Rng;
use serenity::model::id::UserId;
use thiserror::Error;

pub const CHAMBER_COUNT: u8 = 6;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum GameError {
    #[error("at least 2 players are required")]
    NotEnoughPlayers,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Player {
    pub user_id: UserId,
    pub display_name: String,
}

/// Hit-probability rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpinMode {
    /// The cylinder is re-spun before every trigger pull: independent 1-in-6
    /// draws each turn.
    EveryTurn,
    /// The cylinder is spun once at game start: a fixed bullet position and a
    /// chamber that advances deterministically on every miss.
    Once,
}

/// Punishment applied to an eliminated player.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stake {
    Kick,
    Disconnect,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnOutcome {
    /// The game goes on; announce the (possibly new) current player.
    Continue,
    /// Exactly one player left - they win, the session terminates.
    Winner(Player),
    /// Pathological: nobody left. Reachable only through a bug in turn
    /// serialization; reported as "no players left" and asserted against.
    NoPlayers,
}

#[derive(Debug)]
pub struct GameState {
    players: Vec<Player>,
    current: usize,
    mode: SpinMode,
    chamber_position: u8,
    bullet_position: u8,
}

impl GameState {
    /// Starts a game. `players` must already be sorted by display name; the
    /// starting player and (for [`SpinMode::Once`]) the bullet chamber are
    /// drawn from `rng`.
    pub fn start(players: Vec<Player>, mode: SpinMode, rng: &mut impl Rng) -> Result<Self, GameError> {
        if players.len() < 2 {
            return Err(GameError::NotEnoughPlayers);
        }
        let current = rng.gen_range(0..players.len());
        let bullet_position = rng.gen_range(1..=CHAMBER_COUNT);
        Ok(Self {
            players,
            current,
            mode,
            chamber_position: 1,
            bullet_position,
        })
    }

    pub fn current_player(&self) -> Option<&Player> {
        self.players.get(self.current)
    }

    pub fn player_count(&self) -> usize {
        self.players.len()
    }

    pub fn contains(&self, user_id: UserId) -> bool {
        self.players.iter().any(|p| p.user_id == user_id)
    }

    pub fn is_current(&self, user_id: UserId) -> bool {
        self.current_player().is_some_and(|p| p.user_id == user_id)
    }

    #[cfg(test)]
    pub fn chamber_position(&self) -> u8 {
        self.chamber_position
    }

    /// Resolves the trigger pull for the current player.
    ///
    /// `EveryTurn`: independent 1/6 draw. `Once`: hit iff the chamber has
    /// reached the bullet; a miss advances the chamber by one, wrapping from
    /// 6 back to 1 (a deterministic six-turn cycle per cylinder).
    pub fn roll_hit(&mut self, rng: &mut impl Rng) -> bool {
        match self.mode {
            SpinMode::EveryTurn => rng.gen_range(1..=CHAMBER_COUNT) == 1,
            SpinMode::Once => {
                if self.chamber_position == self.bullet_position {
                    return true;
                }
                self.chamber_position = if self.chamber_position == CHAMBER_COUNT {
                    1
                } else {
                    self.chamber_position + 1
                };
                false
            }
        }
    }

    /// Advances the turn. Elimination removes the current player (clamping
    /// the index back into range); survival moves the index forward modulo
    /// the unchanged player count.
    pub fn advance(&mut self, eliminated: bool) -> TurnOutcome {
        if eliminated {
            if self.current < self.players.len() {
                self.players.remove(self.current);
            }
            if self.current >= self.players.len() {
                self.current = 0;
            }
        } else if !self.players.is_empty() {
            self.current = (self.current + 1) % self.players.len();
        }

        match self.players.len() {
            0 => TurnOutcome::NoPlayers,
            1 => TurnOutcome::Winner(self.players[0].clone()),
            _ => TurnOutcome::Continue,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn player(id: u64, name: &str) -> Player {
        Player {
            user_id: UserId::new(id),
            display_name: name.to_string(),
        }
    }

    fn players(n: u64) -> Vec<Player> {
        (1..=n).map(|i| player(i, &format!("p{i}"))).collect()
    }

    fn rng() -> StdRng {
        StdRng::seed_from_u64(42)
    }

    #[test]
    fn start_requires_two_players() {
        let mut rng = rng();
        assert_eq!(
            GameState::start(players(1), SpinMode::EveryTurn, &mut rng).unwrap_err(),
            GameError::NotEnoughPlayers
        );
        assert!(GameState::start(players(2), SpinMode::EveryTurn, &mut rng).is_ok());
    }

    #[test]
    fn spin_once_cycles_chambers_and_guarantees_the_bullet() {
        // Try every seed-independent configuration by brute force: whatever
        // the bullet position, six consecutive pulls contain exactly one hit
        // and the chamber walks 1..=6 then wraps.
        for seed in 0..20 {
            let mut rng = StdRng::seed_from_u64(seed);
            let mut game = GameState::start(players(2), SpinMode::Once, &mut rng).expect("2 players");

            let mut hits = 0;
            let mut positions = Vec::new();
            for _ in 0..CHAMBER_COUNT {
                positions.push(game.chamber_position());
                if game.roll_hit(&mut rng) {
                    hits += 1;
                    // A hit does not advance the chamber; step past it by
                    // hand to keep walking the cylinder.
                    game.chamber_position = if game.chamber_position == CHAMBER_COUNT {
                        1
                    } else {
                        game.chamber_position + 1
                    };
                }
            }

            assert_eq!(hits, 1, "seed {seed}: exactly one live chamber per cylinder");
            assert_eq!(positions, vec![1, 2, 3, 4, 5, 6]);
            assert_eq!(game.chamber_position(), 1, "wraps back after the 6th");
        }
    }

    #[test]
    fn spin_every_turn_converges_to_one_sixth() {
        let mut rng = rng();
        let mut game = GameState::start(players(2), SpinMode::EveryTurn, &mut rng).expect("2 players");

        let trials = 60_000;
        let hits = (0..trials).filter(|_| game.roll_hit(&mut rng)).count();
        let ratio = hits as f64 / trials as f64;

        assert!(
            (ratio - 1.0 / 6.0).abs() < 0.01,
            "hit ratio {ratio} outside tolerance"
        );
    }

    #[test]
    fn elimination_with_two_players_crowns_the_survivor() {
        for seed in 0..10 {
            let mut rng = StdRng::seed_from_u64(seed);
            let mut game = GameState::start(players(2), SpinMode::EveryTurn, &mut rng).expect("2 players");
            let loser = game.current_player().expect("game active").clone();

            match game.advance(true) {
                TurnOutcome::Winner(winner) => assert_ne!(winner.user_id, loser.user_id),
                other => panic!("expected a winner, got {other:?}"),
            }
        }
    }

    #[test]
    fn elimination_clamps_index_when_last_player_falls() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut game = GameState::start(players(4), SpinMode::EveryTurn, &mut rng).expect("4 players");

        // Force the index to the tail, then eliminate.
        while !game.is_current(UserId::new(4)) {
            game.advance(false);
        }
        assert_eq!(game.advance(true), TurnOutcome::Continue);
        assert!(game.is_current(UserId::new(1)), "index wrapped to the head");
        assert_eq!(game.player_count(), 3);
    }

    #[test]
    fn survival_rotates_without_removing() {
        let mut rng = StdRng::seed_from_u64(3);
        let mut game = GameState::start(players(3), SpinMode::EveryTurn, &mut rng).expect("3 players");

        let first = game.current_player().expect("active").user_id;
        assert_eq!(game.advance(false), TurnOutcome::Continue);
        assert_ne!(game.current_player().expect("active").user_id, first);
        assert_eq!(game.player_count(), 3);

        // A full lap returns to the starting player.
        game.advance(false);
        game.advance(false);
        assert!(game.is_current(first));
    }

    #[test]
    fn no_players_is_terminal() {
        let mut rng = StdRng::seed_from_u64(9);
        let mut game = GameState::start(players(2), SpinMode::EveryTurn, &mut rng).expect("2 players");
        game.advance(true);
        assert_eq!(game.advance(true), TurnOutcome::NoPlayers);
    }
}
