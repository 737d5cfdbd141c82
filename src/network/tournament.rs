//! Tournaments
//!
//! Four-player single-elimination brackets. The creator fills slot 1, three
//! joiners fill the rest, and once started a 1 Hz clock drives the stages:
//!
//! ```text
//! LOBBY -> TIMER_SEMI_FINAL -> TOURNAMENT_ON_SEMI -> TIMER_FINAL -> TOURNAMENT_ON_FINAL -> finished
//! ```
//!
//! Every bracket match is hosted by a tournament-flagged [`Lobby`]. Results
//! are collected on clock ticks, never pushed by the tick tasks.

use std::collections::HashSet;
use std::time::Duration;

use rand::seq::SliceRandom;
use rand::Rng;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::game::{MatchOutcome, UserId};
use crate::network::hub::{Hub, HubSignal};
use crate::network::lobby::Lobby;
use crate::network::protocol::{BracketMatch, ServerEvent, TournamentRequest, TournamentRoster};

/// Tournament timing.
#[derive(Debug, Clone)]
pub struct TournamentConfig {
    /// Seconds counted down before the semifinals.
    pub semifinal_countdown_secs: u32,
    /// Seconds counted down before the final.
    pub final_countdown_secs: u32,
    /// Clock ticks a finished tournament lingers before removal.
    pub completion_grace_secs: u32,
    /// Clock period.
    pub clock_period: Duration,
}

impl Default for TournamentConfig {
    fn default() -> Self {
        Self {
            semifinal_countdown_secs: 15,
            final_countdown_secs: 10,
            completion_grace_secs: 5,
            clock_period: Duration::from_secs(1),
        }
    }
}

/// Tournament request failures, reported as `TOURNAMENT_ERROR`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TournamentError {
    /// No tournament under that code.
    #[error("Tournament {0} not found")]
    NotFound(String),
    /// All four slots taken.
    #[error("Tournament is full")]
    Full,
    /// Only slot 1 may start.
    #[error("Only the creator can start the tournament")]
    NotCreator,
    /// Start needs four players.
    #[error("Tournament is not full")]
    NotFull,
    /// Past the waiting room.
    #[error("Tournament has already started")]
    AlreadyStarted,
    /// Caller holds no slot.
    #[error("Not a member of this tournament")]
    NotMember,
}

/// Bracket stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Collecting players.
    WaitingRoom,
    /// Counting down to the semifinals.
    SemiFinalCountdown {
        /// Next value broadcast.
        remaining: u32,
    },
    /// Semifinals running.
    SemiFinals,
    /// Counting down to the final.
    FinalCountdown {
        /// Next value broadcast.
        remaining: u32,
    },
    /// Final running.
    Final,
    /// Done, waiting to be removed.
    Finished {
        /// Clock ticks left before removal.
        linger: u32,
    },
}

impl Stage {
    /// Label used in logs.
    pub fn label(&self) -> &'static str {
        match self {
            Stage::WaitingRoom => "LOBBY",
            Stage::SemiFinalCountdown { .. } => "TIMER_SEMI_FINAL",
            Stage::SemiFinals => "TOURNAMENT_ON_SEMI",
            Stage::FinalCountdown { .. } => "TIMER_FINAL",
            Stage::Final => "TOURNAMENT_ON_FINAL",
            Stage::Finished { .. } => "FINISHED",
        }
    }
}

/// Bracket position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Round {
    /// First semifinal; its winner is the final's first contestant.
    Semi1,
    /// Second semifinal; its winner is the final's second contestant.
    Semi2,
    /// Final.
    Final,
}

impl Round {
    /// All rounds, in bracket order.
    pub const ALL: [Round; 3] = [Round::Semi1, Round::Semi2, Round::Final];
}

/// Shuffle four players into two semifinals.
pub fn draw_bracket<R: Rng + ?Sized>(mut players: [UserId; 4], rng: &mut R) -> [BracketMatch; 2] {
    players.shuffle(rng);
    let pair = |a: UserId, b: UserId| BracketMatch {
        player1: a,
        player2: b,
        ..Default::default()
    };
    [pair(players[0], players[1]), pair(players[2], players[3])]
}

/// One tournament.
#[derive(Debug)]
pub struct Tournament {
    /// Tournament id (a UUID string).
    pub id: String,
    /// Four slots; slot 0 is the creator.
    pub slots: [Option<UserId>; 4],
    /// First semifinal.
    pub semi1: BracketMatch,
    /// Second semifinal.
    pub semi2: BracketMatch,
    /// Final.
    pub final_match: BracketMatch,
    /// Current stage.
    pub stage: Stage,
    withdrawn: HashSet<UserId>,
    destroy: broadcast::Sender<()>,
}

impl Tournament {
    /// Fresh tournament owned by `creator`.
    pub fn new(creator: UserId) -> Self {
        let (destroy, _) = broadcast::channel(1);
        Self {
            id: Uuid::new_v4().to_string(),
            slots: [Some(creator), None, None, None],
            semi1: BracketMatch::default(),
            semi2: BracketMatch::default(),
            final_match: BracketMatch::default(),
            stage: Stage::WaitingRoom,
            withdrawn: HashSet::new(),
            destroy,
        }
    }

    /// First dash-separated segment of the id, as shown to players.
    pub fn short_code(&self) -> &str {
        self.id.split('-').next().unwrap_or(&self.id)
    }

    /// Whether `code` names this tournament, in full or short form.
    pub fn matches_code(&self, code: &str) -> bool {
        !code.is_empty() && (code == self.id || code == self.short_code())
    }

    /// Slot 1.
    pub fn creator(&self) -> Option<UserId> {
        self.slots[0]
    }

    /// Whether `user` holds a slot.
    pub fn contains(&self, user: UserId) -> bool {
        self.slots.contains(&Some(user))
    }

    /// Occupied slots, in slot order.
    pub fn participants(&self) -> Vec<UserId> {
        self.slots.iter().flatten().copied().collect()
    }

    /// All four slots taken.
    pub fn is_full(&self) -> bool {
        self.slots.iter().all(Option::is_some)
    }

    /// Take the first free slot. `Ok(false)` if `user` is already in.
    pub fn join(&mut self, user: UserId) -> Result<bool, TournamentError> {
        if self.contains(user) {
            return Ok(false);
        }
        if self.stage != Stage::WaitingRoom {
            return Err(TournamentError::AlreadyStarted);
        }
        let slot = self
            .slots
            .iter_mut()
            .skip(1)
            .find(|slot| slot.is_none())
            .ok_or(TournamentError::Full)?;
        *slot = Some(user);
        Ok(true)
    }

    /// Clear `user`'s slot. The creator's slot is never cleared.
    pub fn leave_waiting_room(&mut self, user: UserId) -> bool {
        match self.slots.iter_mut().skip(1).find(|slot| **slot == Some(user)) {
            Some(slot) => {
                *slot = None;
                true
            }
            None => false,
        }
    }

    /// Roster body, `user_id` naming who acted.
    pub fn roster(&self, user_id: UserId) -> TournamentRoster {
        let slot = |i: usize| self.slots[i].unwrap_or_default();
        TournamentRoster {
            code: self.id.clone(),
            user_id,
            player1: slot(0),
            player2: slot(1),
            player3: slot(2),
            player4: slot(3),
        }
    }

    /// Full bracket event.
    pub fn tree_event(&self) -> ServerEvent {
        ServerEvent::TournamentTreeState {
            code: self.id.clone(),
            semi1: self.semi1,
            semi2: self.semi2,
            final_match: self.final_match,
        }
    }

    /// Descriptor of `round`.
    pub fn bracket(&self, round: Round) -> BracketMatch {
        match round {
            Round::Semi1 => self.semi1,
            Round::Semi2 => self.semi2,
            Round::Final => self.final_match,
        }
    }

    fn bracket_mut(&mut self, round: Round) -> &mut BracketMatch {
        match round {
            Round::Semi1 => &mut self.semi1,
            Round::Semi2 => &mut self.semi2,
            Round::Final => &mut self.final_match,
        }
    }

    /// Lobbies hosting this tournament's matches.
    pub fn lobby_ids(&self) -> Vec<Uuid> {
        Round::ALL
            .iter()
            .filter_map(|&round| self.bracket(round).lobby_id)
            .collect()
    }

    /// Draw the semifinals. `false` unless all four slots are taken.
    pub fn seed<R: Rng + ?Sized>(&mut self, rng: &mut R) -> bool {
        let [Some(a), Some(b), Some(c), Some(d)] = self.slots else {
            return false;
        };
        let [semi1, semi2] = draw_bracket([a, b, c, d], rng);
        self.semi1 = semi1;
        self.semi2 = semi2;
        self.final_match = BracketMatch::default();
        true
    }

    /// Record a played match. A tie advances the descriptor's first
    /// contestant. Returns who advanced.
    pub fn record_result(&mut self, round: Round, outcome: &MatchOutcome) -> Option<UserId> {
        let m = self.bracket_mut(round);
        if m.is_finished {
            return None;
        }
        let (score1, score2) = outcome.score_for(m.player1)?;
        m.score1 = score1;
        m.score2 = score2;
        m.is_finished = true;
        let winner = outcome.winner.unwrap_or(m.player1);
        self.advance(round, winner);
        Some(winner)
    }

    /// Finish `round` without playing it: `leaver` scores 0, the opponent
    /// the winning score. Returns who advanced.
    pub fn walkover(&mut self, round: Round, leaver: UserId, winning_score: u32) -> Option<UserId> {
        let m = self.bracket_mut(round);
        if m.is_finished {
            return None;
        }
        let winner = if m.player1 == leaver {
            m.score1 = 0;
            m.score2 = winning_score;
            m.player2
        } else if m.player2 == leaver {
            m.score1 = winning_score;
            m.score2 = 0;
            m.player1
        } else {
            return None;
        };
        m.is_finished = true;
        self.advance(round, winner);
        Some(winner)
    }

    fn advance(&mut self, round: Round, winner: UserId) {
        match round {
            Round::Semi1 => self.final_match.player1 = winner,
            Round::Semi2 => self.final_match.player2 = winner,
            Round::Final => {}
        }
    }

    /// Mark `user` as gone for the rest of the bracket.
    pub fn withdraw(&mut self, user: UserId) {
        self.withdrawn.insert(user);
    }

    /// Withdrawn contestant of an unfinished, fully seeded `round`.
    pub fn walkover_leaver(&self, round: Round) -> Option<UserId> {
        let m = self.bracket(round);
        if m.is_finished || m.player1 == 0 || m.player2 == 0 {
            return None;
        }
        [m.player1, m.player2]
            .into_iter()
            .find(|p| self.withdrawn.contains(p))
    }

    /// Both semifinals decided.
    pub fn semis_finished(&self) -> bool {
        self.semi1.is_finished && self.semi2.is_finished
    }

    /// Tournament winner, once the final is decided.
    pub fn champion(&self) -> Option<UserId> {
        let m = &self.final_match;
        if !m.is_finished {
            return None;
        }
        Some(if m.score1 >= m.score2 { m.player1 } else { m.player2 })
    }

    /// Receiver for the destroy signal.
    pub fn subscribe_destroy(&self) -> broadcast::Receiver<()> {
        self.destroy.subscribe()
    }

    /// Stop the clock task.
    pub fn destroy(&self) {
        let _ = self.destroy.send(());
    }
}

/// Emit one clock signal per period until the tournament is destroyed.
async fn run_clock(
    id: String,
    period: Duration,
    signals: mpsc::UnboundedSender<HubSignal>,
    mut destroy: broadcast::Receiver<()>,
) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = destroy.recv() => break,
            _ = ticker.tick() => {
                if signals.send(HubSignal::TournamentClock(id.clone())).is_err() {
                    break;
                }
            }
        }
    }
    debug!(tournament = %id, "Tournament clock stopped");
}

// =============================================================================
// HUB: TOURNAMENT PROTOCOL
// =============================================================================

impl Hub {
    pub(crate) fn handle_tournament(&mut self, caller: UserId, request: TournamentRequest) {
        let code = request.payload().code.clone();
        let result = match request {
            TournamentRequest::Create(_) => {
                self.tournament_create(caller);
                Ok(())
            }
            TournamentRequest::Join(_) => self.tournament_join(caller, &code),
            TournamentRequest::LeaveWaitingRoom(_) => self.tournament_leave(caller, &code),
            TournamentRequest::Start(_) => self.tournament_start(caller, &code),
            TournamentRequest::TreeState(_) => self.tournament_tree_state(caller, &code),
        };

        if let Err(err) = result {
            debug!(user = caller, code = %code, "Tournament request refused: {}", err);
            self.send_to(
                caller,
                &ServerEvent::TournamentError {
                    code,
                    error: err.to_string(),
                },
            );
        }
    }

    /// Id of the tournament `code` names.
    fn find_tournament(&self, code: &str) -> Result<String, TournamentError> {
        if self.tournaments.contains_key(code) {
            return Ok(code.to_string());
        }
        self.tournaments
            .values()
            .find(|t| t.matches_code(code))
            .map(|t| t.id.clone())
            .ok_or_else(|| TournamentError::NotFound(code.to_string()))
    }

    fn tournament_create(&mut self, caller: UserId) {
        let tournament = Tournament::new(caller);
        let roster = tournament.roster(caller);
        info!(tournament = %tournament.id, creator = caller, "Tournament created");
        self.tournaments.insert(tournament.id.clone(), tournament);
        self.send_to(caller, &ServerEvent::TournamentCreated(roster));
    }

    fn tournament_join(&mut self, caller: UserId, code: &str) -> Result<(), TournamentError> {
        let id = self.find_tournament(code)?;
        let Some(t) = self.tournaments.get_mut(&id) else {
            return Err(TournamentError::NotFound(code.to_string()));
        };
        if t.join(caller)? {
            info!(tournament = %id, user = caller, "Joined tournament");
        }
        let roster = t.roster(caller);
        let participants = t.participants();
        self.send_to(caller, &ServerEvent::TournamentJoined(roster.clone()));
        self.send_to_many(&participants, &ServerEvent::TournamentRosterChanged(roster));
        Ok(())
    }

    fn tournament_leave(&mut self, caller: UserId, code: &str) -> Result<(), TournamentError> {
        let id = self.find_tournament(code)?;
        let Some(t) = self.tournaments.get(&id) else {
            return Err(TournamentError::NotFound(code.to_string()));
        };
        if !t.contains(caller) {
            return Err(TournamentError::NotMember);
        }
        if t.stage != Stage::WaitingRoom {
            return Err(TournamentError::AlreadyStarted);
        }
        self.leave_waiting_room(&id, caller);
        Ok(())
    }

    /// Creator leaving terminates; anyone else frees their slot.
    fn leave_waiting_room(&mut self, id: &str, user: UserId) {
        let Some(t) = self.tournaments.get_mut(id) else {
            return;
        };
        if t.creator() == Some(user) {
            let roster = t.roster(user);
            let participants = t.participants();
            self.remove_tournament(id);
            self.send_to_many(&participants, &ServerEvent::TournamentTerminated(roster));
            info!(tournament = %id, "Tournament terminated by creator");
        } else if t.leave_waiting_room(user) {
            let roster = t.roster(user);
            let mut recipients = t.participants();
            recipients.push(user);
            self.send_to_many(&recipients, &ServerEvent::TournamentRosterChanged(roster));
            info!(tournament = %id, user, "Left tournament waiting room");
        }
    }

    fn tournament_start(&mut self, caller: UserId, code: &str) -> Result<(), TournamentError> {
        let id = self.find_tournament(code)?;
        let countdown = self.config.tournament.semifinal_countdown_secs;
        let period = self.config.tournament.clock_period;
        let Some(t) = self.tournaments.get_mut(&id) else {
            return Err(TournamentError::NotFound(code.to_string()));
        };
        if t.creator() != Some(caller) {
            return Err(TournamentError::NotCreator);
        }
        if t.stage != Stage::WaitingRoom {
            return Err(TournamentError::AlreadyStarted);
        }
        if !t.seed(&mut rand::thread_rng()) {
            return Err(TournamentError::NotFull);
        }

        for semi in [&mut t.semi1, &mut t.semi2] {
            let lobby = Lobby::for_tournament(Uuid::new_v4(), semi.player1, semi.player2);
            semi.lobby_id = Some(lobby.id);
            self.lobbies.insert(lobby.id, lobby);
        }
        t.stage = Stage::SemiFinalCountdown { remaining: countdown };
        let tree = t.tree_event();
        let participants = t.participants();
        tokio::spawn(run_clock(id.clone(), period, self.signals.clone(), t.subscribe_destroy()));

        info!(tournament = %id, players = ?participants, "Tournament started");
        self.send_to_many(&participants, &tree);
        Ok(())
    }

    fn tournament_tree_state(&mut self, caller: UserId, code: &str) -> Result<(), TournamentError> {
        let id = self.find_tournament(code)?;
        let Some(tree) = self.tournaments.get(&id).map(Tournament::tree_event) else {
            return Err(TournamentError::NotFound(code.to_string()));
        };
        self.send_to(caller, &tree);
        Ok(())
    }

    // =========================================================================
    // CLOCK
    // =========================================================================

    /// Advance tournament `id` by one clock tick.
    pub(crate) fn on_tournament_clock(&mut self, id: &str) {
        let Some(stage) = self.tournaments.get(id).map(|t| t.stage) else {
            return;
        };

        match stage {
            Stage::WaitingRoom => {}
            Stage::SemiFinalCountdown { remaining } => {
                self.broadcast_timer(id, remaining);
                if remaining == 0 {
                    self.launch_round(id, Round::Semi1);
                    self.launch_round(id, Round::Semi2);
                    self.set_stage(id, Stage::SemiFinals);
                } else {
                    self.set_stage(id, Stage::SemiFinalCountdown { remaining: remaining - 1 });
                }
            }
            Stage::SemiFinals => {
                self.collect_result(id, Round::Semi1);
                self.collect_result(id, Round::Semi2);
                self.settle_walkovers(id);
                self.prepare_final(id);
            }
            Stage::FinalCountdown { remaining } => {
                // a walkover may already have decided the final
                if self.tournaments.get(id).is_some_and(|t| t.final_match.is_finished) {
                    self.complete_tournament(id);
                    return;
                }
                self.broadcast_timer(id, remaining);
                if remaining == 0 {
                    self.launch_round(id, Round::Final);
                    self.set_stage(id, Stage::Final);
                } else {
                    self.set_stage(id, Stage::FinalCountdown { remaining: remaining - 1 });
                }
            }
            Stage::Final => {
                self.collect_result(id, Round::Final);
                self.complete_tournament(id);
            }
            Stage::Finished { linger: 0 } => self.remove_tournament(id),
            Stage::Finished { linger } => self.set_stage(id, Stage::Finished { linger: linger - 1 }),
        }
    }

    fn set_stage(&mut self, id: &str, stage: Stage) {
        if let Some(t) = self.tournaments.get_mut(id) {
            debug!(tournament = %id, from = t.stage.label(), to = stage.label(), "Tournament stage");
            t.stage = stage;
        }
    }

    fn broadcast_timer(&mut self, id: &str, remaining: u32) {
        let Some(participants) = self.tournaments.get(id).map(Tournament::participants) else {
            return;
        };
        self.send_to_many(
            &participants,
            &ServerEvent::TournamentTimer {
                code: id.to_string(),
                remaining_time: remaining,
            },
        );
    }

    /// Announce and start the match of `round`, unless already decided.
    fn launch_round(&mut self, id: &str, round: Round) {
        let Some(m) = self.tournaments.get(id).map(|t| t.bracket(round)) else {
            return;
        };
        if m.is_finished {
            return;
        }
        let Some(lobby_id) = m.lobby_id else {
            warn!(tournament = %id, ?round, "Round has no lobby");
            return;
        };
        self.send_to_many(
            &[m.player1, m.player2],
            &ServerEvent::TournamentGame {
                code: id.to_string(),
                lobby_id,
            },
        );
        self.start_lobby_match(lobby_id);
    }

    /// Copy a finished match's result into the bracket.
    fn collect_result(&mut self, id: &str, round: Round) {
        let Some(m) = self.tournaments.get(id).map(|t| t.bracket(round)) else {
            return;
        };
        if m.is_finished {
            return;
        }
        let Some(outcome) = m
            .lobby_id
            .and_then(|lobby_id| self.lobbies.get(&lobby_id))
            .and_then(Lobby::outcome)
        else {
            return;
        };
        if let Some(t) = self.tournaments.get_mut(id) {
            if let Some(winner) = t.record_result(round, &outcome) {
                info!(tournament = %id, ?round, winner, score = ?outcome.score, "Bracket match decided");
            }
        }
    }

    /// Finish unplayed rounds whose contestant has withdrawn.
    fn settle_walkovers(&mut self, id: &str) {
        let winning_score = self.config.game.winning_score;
        let Some(t) = self.tournaments.get_mut(id) else {
            return;
        };
        for round in Round::ALL {
            let launched = t
                .bracket(round)
                .lobby_id
                .and_then(|lobby_id| self.lobbies.get(&lobby_id))
                .is_some_and(|lobby| lobby.game.is_some());
            if launched {
                continue;
            }
            if let Some(leaver) = t.walkover_leaver(round) {
                let winner = t.walkover(round, leaver, winning_score);
                info!(tournament = %id, ?round, leaver, ?winner, "Walkover");
            }
        }
    }

    /// Once both semifinals are decided, open the final's lobby and count down.
    fn prepare_final(&mut self, id: &str) {
        let countdown = self.config.tournament.final_countdown_secs;
        let Some(t) = self.tournaments.get_mut(id) else {
            return;
        };
        if !t.semis_finished() {
            return;
        }
        if t.final_match.is_finished {
            t.stage = Stage::Final;
            return;
        }
        if t.final_match.lobby_id.is_none() {
            let lobby = Lobby::for_tournament(Uuid::new_v4(), t.final_match.player1, t.final_match.player2);
            t.final_match.lobby_id = Some(lobby.id);
            self.lobbies.insert(lobby.id, lobby);
        }
        t.stage = Stage::FinalCountdown { remaining: countdown };
        info!(
            tournament = %id,
            finalists = ?[t.final_match.player1, t.final_match.player2],
            "Final scheduled"
        );
    }

    fn complete_tournament(&mut self, id: &str) {
        let linger = self.config.tournament.completion_grace_secs;
        let Some(t) = self.tournaments.get_mut(id) else {
            return;
        };
        if !t.final_match.is_finished {
            return;
        }
        t.stage = Stage::Finished { linger };
        let tree = t.tree_event();
        let participants = t.participants();
        info!(tournament = %id, champion = ?t.champion(), "Tournament finished");
        self.send_to_many(&participants, &tree);
    }

    /// Drop a tournament with its lobbies and stop its clock.
    pub(crate) fn remove_tournament(&mut self, id: &str) {
        let Some(t) = self.tournaments.remove(id) else {
            return;
        };
        for lobby_id in t.lobby_ids() {
            if let Some(lobby) = self.lobbies.remove(&lobby_id) {
                lobby.destroy();
            }
        }
        t.destroy();
        debug!(tournament = %id, "Tournament removed");
    }

    /// Disconnect cascade for tournaments.
    pub(crate) fn tournament_departure(&mut self, user: UserId) {
        let ids: Vec<String> = self
            .tournaments
            .values()
            .filter(|t| t.contains(user))
            .map(|t| t.id.clone())
            .collect();

        for id in ids {
            let Some(t) = self.tournaments.get_mut(&id) else {
                continue;
            };
            let stage = t.stage;
            match stage {
                Stage::WaitingRoom => self.leave_waiting_room(&id, user),
                Stage::Finished { .. } => {}
                _ => {
                    t.withdraw(user);
                    for lobby_id in t.lobby_ids() {
                        let game = self
                            .lobbies
                            .get(&lobby_id)
                            .filter(|lobby| lobby.has_participant(user))
                            .and_then(|lobby| lobby.game.as_ref());
                        if let Some(game) = game {
                            if game.player_left(user) {
                                info!(tournament = %id, user, "Tournament match forfeited");
                            }
                        }
                    }
                    self.settle_walkovers(&id);
                }
            }
        }
    }
}
