use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Policy a multi-loop server uses to decide which loop accepts a connection
///
/// Every loop is woken when a listener becomes readable; each one consults
/// the policy and either accepts or yields to its peers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LoadBalance {
    /// First loop to win the OS accept race takes the connection
    #[default]
    Random,
    /// Loops take turns following a server-wide accept counter
    RoundRobin,
    /// The loop holding the fewest live connections accepts
    LeastConnections,
}

impl LoadBalance {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoadBalance::Random => "random",
            LoadBalance::RoundRobin => "round-robin",
            LoadBalance::LeastConnections => "least-connections",
        }
    }
}

impl fmt::Display for LoadBalance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LoadBalance {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "random" => Ok(LoadBalance::Random),
            "round-robin" | "roundrobin" | "rr" => Ok(LoadBalance::RoundRobin),
            "least-connections" | "leastconnections" | "lc" => Ok(LoadBalance::LeastConnections),
            other => Err(format!("unknown load balance policy '{}'", other)),
        }
    }
}

/// Decide whether loop `index` should accept the next connection
///
/// `counts` holds the live-connection counter of every loop and `accepted`
/// the server-wide accept counter. A single loop always accepts.
pub fn should_accept(
    policy: LoadBalance,
    index: usize,
    counts: &[AtomicUsize],
    accepted: &AtomicUsize,
) -> bool {
    let num_loops = counts.len();
    if num_loops <= 1 {
        return true;
    }

    match policy {
        LoadBalance::Random => true,
        LoadBalance::RoundRobin => accepted.load(Ordering::Acquire) % num_loops == index,
        LoadBalance::LeastConnections => {
            let mine = counts[index].load(Ordering::Acquire);
            counts
                .iter()
                .enumerate()
                .all(|(i, count)| i == index || count.load(Ordering::Acquire) >= mine)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counters(values: &[usize]) -> Vec<AtomicUsize> {
        values.iter().map(|v| AtomicUsize::new(*v)).collect()
    }

    #[test]
    fn test_single_loop_always_accepts() {
        let counts = counters(&[7]);
        let accepted = AtomicUsize::new(3);
        for policy in [
            LoadBalance::Random,
            LoadBalance::RoundRobin,
            LoadBalance::LeastConnections,
        ] {
            assert!(should_accept(policy, 0, &counts, &accepted));
        }
    }

    #[test]
    fn test_round_robin_turns() {
        let counts = counters(&[0, 0, 0]);
        let accepted = AtomicUsize::new(0);
        let mut order = Vec::new();

        for _ in 0..6 {
            let winner = (0..3)
                .find(|&i| should_accept(LoadBalance::RoundRobin, i, &counts, &accepted))
                .unwrap();
            order.push(winner);
            accepted.fetch_add(1, Ordering::AcqRel);
        }

        assert_eq!(order, vec![0, 1, 2, 0, 1, 2]);
    }

    #[test]
    fn test_round_robin_only_one_winner() {
        let counts = counters(&[0, 0, 0, 0]);
        let accepted = AtomicUsize::new(5);
        let winners: Vec<_> = (0..4)
            .filter(|&i| should_accept(LoadBalance::RoundRobin, i, &counts, &accepted))
            .collect();
        assert_eq!(winners, vec![1]);
    }

    #[test]
    fn test_least_connections() {
        let counts = counters(&[3, 1, 2]);
        let accepted = AtomicUsize::new(0);
        assert!(!should_accept(LoadBalance::LeastConnections, 0, &counts, &accepted));
        assert!(should_accept(LoadBalance::LeastConnections, 1, &counts, &accepted));
        assert!(!should_accept(LoadBalance::LeastConnections, 2, &counts, &accepted));
    }

    #[test]
    fn test_least_connections_ties_accept() {
        let counts = counters(&[2, 2, 5]);
        let accepted = AtomicUsize::new(0);
        assert!(should_accept(LoadBalance::LeastConnections, 0, &counts, &accepted));
        assert!(should_accept(LoadBalance::LeastConnections, 1, &counts, &accepted));
        assert!(!should_accept(LoadBalance::LeastConnections, 2, &counts, &accepted));
    }

    #[test]
    fn test_least_connections_spread() {
        // Simulate sequential accepts: the spread never exceeds one
        let counts = counters(&[0, 0, 0]);
        let accepted = AtomicUsize::new(0);
        for _ in 0..30 {
            let winner = (0..3)
                .find(|&i| should_accept(LoadBalance::LeastConnections, i, &counts, &accepted))
                .unwrap();
            counts[winner].fetch_add(1, Ordering::AcqRel);

            let values: Vec<usize> = counts.iter().map(|c| c.load(Ordering::Acquire)).collect();
            let min = *values.iter().min().unwrap();
            let max = *values.iter().max().unwrap();
            assert!(max - min <= 1, "unbalanced: {:?}", values);
        }
    }

    #[test]
    fn test_parse_policy() {
        assert_eq!("random".parse::<LoadBalance>(), Ok(LoadBalance::Random));
        assert_eq!("Round-Robin".parse::<LoadBalance>(), Ok(LoadBalance::RoundRobin));
        assert_eq!("lc".parse::<LoadBalance>(), Ok(LoadBalance::LeastConnections));
        assert!("fastest".parse::<LoadBalance>().is_err());
        assert_eq!(LoadBalance::RoundRobin.to_string(), "round-robin");
    }
}
