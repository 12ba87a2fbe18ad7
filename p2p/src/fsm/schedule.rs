//! Periodic task schedule.
//!
//! The engine runs all of its recurring work off a single table built once
//! at startup: each entry carries an interval and fires whenever the clock
//! passes its deadline. There are no per-peer timers; sweeps over the peer
//! table happen at the task level.
use finney_net::time::{LocalDuration, LocalTime};

/// The recurring tasks of the engine.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TaskKind {
    /// Ping every hand-shaken peer, accounting for unanswered pings.
    PingPeers,
    /// Sweep peers for handshake timeouts, expired lifetimes and high latency.
    CheckConnectivity,
    /// Request headers and missing blocks from idle peers.
    ExchangeData,
    /// Recompute whether the node is in initial block download.
    ResetIbd,
    /// Log a status snapshot.
    PrintStatus,
    /// Ask the chain store to persist itself.
    SaveChain,
    /// Stop the engine.
    AutoExit,
}

#[derive(Debug, Clone)]
struct Task {
    kind: TaskKind,
    interval: LocalDuration,
    one_shot: bool,
    next: LocalTime,
}

/// The task table. Tasks with a zero interval are disabled and never enter
/// the table.
#[derive(Debug, Clone, Default)]
pub struct Schedule {
    tasks: Vec<Task>,
}

impl Schedule {
    /// Create an empty schedule.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a recurring task. A zero interval disables it.
    pub fn task(&mut self, kind: TaskKind, interval: LocalDuration) -> &mut Self {
        self.register(kind, interval, false)
    }

    /// Register a task that fires once and is then removed.
    pub fn one_shot(&mut self, kind: TaskKind, interval: LocalDuration) -> &mut Self {
        self.register(kind, interval, true)
    }

    fn register(&mut self, kind: TaskKind, interval: LocalDuration, one_shot: bool) -> &mut Self {
        if !interval.is_zero() {
            self.tasks.push(Task {
                kind,
                interval,
                one_shot,
                next: LocalTime::default(),
            });
        }
        self
    }

    /// Arm all deadlines relative to the given start time. Must be called
    /// once before [`Schedule::due`].
    pub fn initialize(&mut self, now: LocalTime) {
        for task in self.tasks.iter_mut() {
            task.next = now + task.interval;
        }
    }

    /// Collect the tasks whose deadline has passed, advancing their
    /// deadlines. Missed intervals are coalesced into a single run.
    pub fn due(&mut self, now: LocalTime) -> Vec<TaskKind> {
        let mut due = Vec::new();

        self.tasks.retain_mut(|task| {
            if task.next <= now {
                due.push(task.kind);

                if task.one_shot {
                    return false;
                }
                while task.next <= now {
                    task.next = task.next + task.interval;
                }
            }
            true
        });
        due
    }

    /// Time until the nearest deadline, if any task is armed.
    pub fn wait(&self, now: LocalTime) -> Option<LocalDuration> {
        self.tasks.iter().map(|t| t.next - now).min()
    }

    /// Whether any task is armed.
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_interval_disables() {
        let mut schedule = Schedule::new();
        schedule
            .task(TaskKind::PingPeers, LocalDuration::ZERO)
            .one_shot(TaskKind::AutoExit, LocalDuration::ZERO);

        assert!(schedule.is_empty());
        assert_eq!(schedule.wait(LocalTime::default()), None);
    }

    #[test]
    fn test_intervals_fire_and_rearm() {
        let start = LocalTime::from_secs(100);
        let mut schedule = Schedule::new();
        schedule
            .task(TaskKind::ExchangeData, LocalDuration::from_secs(1))
            .task(TaskKind::PrintStatus, LocalDuration::from_secs(2));
        schedule.initialize(start);

        assert_eq!(schedule.due(start), vec![]);
        assert_eq!(
            schedule.due(start + LocalDuration::from_secs(1)),
            vec![TaskKind::ExchangeData]
        );
        assert_eq!(
            schedule.due(start + LocalDuration::from_secs(2)),
            vec![TaskKind::ExchangeData, TaskKind::PrintStatus]
        );
        assert_eq!(
            schedule.wait(start + LocalDuration::from_secs(2)),
            Some(LocalDuration::from_secs(1))
        );
    }

    #[test]
    fn test_missed_intervals_coalesce() {
        let start = LocalTime::from_secs(0);
        let mut schedule = Schedule::new();
        schedule.task(TaskKind::PingPeers, LocalDuration::from_secs(10));
        schedule.initialize(start);

        // An hour passes in one step; the task fires once, not 360 times.
        let late = start + LocalDuration::from_mins(60);
        assert_eq!(schedule.due(late), vec![TaskKind::PingPeers]);
        assert_eq!(schedule.due(late), vec![]);
        assert_eq!(schedule.wait(late), Some(LocalDuration::from_secs(10)));
    }

    #[test]
    fn test_one_shot_runs_once() {
        let start = LocalTime::from_secs(0);
        let mut schedule = Schedule::new();
        schedule.one_shot(TaskKind::AutoExit, LocalDuration::from_mins(30));
        schedule.initialize(start);

        let expiry = start + LocalDuration::from_mins(30);
        assert_eq!(schedule.due(expiry), vec![TaskKind::AutoExit]);
        assert!(schedule.is_empty());
        assert_eq!(schedule.due(expiry + LocalDuration::from_mins(30)), vec![]);
    }
}
