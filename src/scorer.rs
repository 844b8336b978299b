//! Engagement scoring
//!
//! Turns conversation signals into a reply probability (0..=100), then
//! makes the random draw. The score itself is pure and deterministic; only
//! [`roll`] and [`pick_one`] consume randomness.

use std::time::Duration;

use rand::Rng;

/// Burst bonus: +10 per 3 recent messages
const BURST_STEP: u32 = 3;
const BURST_POINTS: i32 = 10;
const BURST_CAP: i32 = 30;

/// Penalty while the persona's previous reply is still fresh
const RECENT_REPLY_WINDOW: Duration = Duration::from_secs(5 * 60);
const RECENT_REPLY_PENALTY: i32 = 20;

const QUESTION_BONUS: i32 = 30;

/// Bonus for reviving a conversation that went quiet
const STALE_AFTER: Duration = Duration::from_secs(30 * 60);
const STALE_BONUS: i32 = 15;

/// Compute the reply probability in percent.
///
/// `since_last_reply` is `None` when the persona has never replied.
pub fn score(
    base_percent: u8,
    recent_message_count: u32,
    since_last_reply: Option<Duration>,
    text: &str,
    since_last_activity: Duration,
) -> u8 {
    let mut score = base_percent as i32;

    let bursts = (recent_message_count / BURST_STEP).min(BURST_CAP as u32) as i32;
    score += (bursts * BURST_POINTS).min(BURST_CAP);

    if let Some(since) = since_last_reply {
        if since > Duration::ZERO && since < RECENT_REPLY_WINDOW {
            score -= RECENT_REPLY_PENALTY;
        }
    }

    if text.trim().ends_with('?') {
        score += QUESTION_BONUS;
    }

    if since_last_activity > STALE_AFTER {
        score += STALE_BONUS;
    }

    score.clamp(0, 100) as u8
}

/// Draw once in [0, 100) and engage iff the draw falls under the score.
pub fn roll<R: Rng + ?Sized>(score: u8, rng: &mut R) -> bool {
    let draw: f64 = rng.gen_range(0.0..100.0);
    draw < score as f64
}

/// Choose exactly one of the qualifiers, uniformly.
///
/// Uniform rather than highest-score so that no persona is systematically
/// favored when several pass their draw.
pub fn pick_one<T, R: Rng + ?Sized>(mut qualifiers: Vec<T>, rng: &mut R) -> Option<T> {
    if qualifiers.is_empty() {
        return None;
    }
    let idx = rng.gen_range(0..qualifiers.len());
    Some(qualifiers.swap_remove(idx))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    const MIN: Duration = Duration::from_secs(60);

    #[test]
    fn test_base_only() {
        assert_eq!(score(50, 0, None, "hello", Duration::ZERO), 50);
    }

    #[test]
    fn test_question_bonus() {
        assert_eq!(score(50, 0, None, "hello?", Duration::ZERO), 80);
        assert_eq!(score(50, 0, None, "  hello?  \n", Duration::ZERO), 80);
        assert_eq!(score(50, 0, None, "what? no", Duration::ZERO), 50);
    }

    #[test]
    fn test_burst_bonus_clamped() {
        assert_eq!(score(90, 9, None, "x", Duration::ZERO), 100);
        assert_eq!(score(0, 2, None, "x", Duration::ZERO), 0);
        assert_eq!(score(0, 3, None, "x", Duration::ZERO), 10);
        assert_eq!(score(0, 8, None, "x", Duration::ZERO), 20);
        assert_eq!(score(0, 9, None, "x", Duration::ZERO), 30);
        assert_eq!(score(0, 300, None, "x", Duration::ZERO), 30);
        assert_eq!(score(0, u32::MAX, None, "x", Duration::ZERO), 30);
    }

    #[test]
    fn test_recent_reply_penalty() {
        assert_eq!(score(50, 0, Some(2 * MIN), "x", Duration::ZERO), 30);
        assert_eq!(score(50, 0, Some(Duration::ZERO), "x", Duration::ZERO), 50);
        assert_eq!(score(50, 0, Some(5 * MIN), "x", Duration::ZERO), 50);
        assert_eq!(score(10, 0, Some(MIN), "x", Duration::ZERO), 0);
    }

    #[test]
    fn test_stale_bonus() {
        assert_eq!(score(50, 0, None, "x", 30 * MIN), 50);
        assert_eq!(score(50, 0, None, "x", 31 * MIN), 65);
    }

    #[test]
    fn test_combined_scenario() {
        // burst +20, recent reply -20, question +30
        assert_eq!(score(20, 6, Some(2 * MIN), "are you free?", Duration::ZERO), 50);
    }

    #[test]
    fn test_upper_clamp() {
        assert_eq!(score(100, 30, None, "really?", 60 * MIN), 100);
    }

    #[test]
    fn test_roll_extremes() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..1_000 {
            assert!(!roll(0, &mut rng));
            assert!(roll(100, &mut rng));
        }
    }

    #[test]
    fn test_roll_rate_matches_score() {
        let mut rng = StdRng::seed_from_u64(42);
        let trials = 20_000;
        let hits = (0..trials).filter(|_| roll(30, &mut rng)).count();
        let rate = hits as f64 / trials as f64;
        assert!((0.28..0.32).contains(&rate), "rate was {rate}");
    }

    #[test]
    fn test_pick_one_empty() {
        let mut rng = StdRng::seed_from_u64(1);
        assert_eq!(pick_one(Vec::<u8>::new(), &mut rng), None);
    }

    #[test]
    fn test_pick_one_is_uniform() {
        let mut rng = StdRng::seed_from_u64(99);
        let mut counts = [0usize; 3];
        let trials = 30_000;
        for _ in 0..trials {
            let chosen = pick_one(vec![0usize, 1, 2], &mut rng).expect("non-empty");
            counts[chosen] += 1;
        }
        for count in counts {
            let share = count as f64 / trials as f64;
            assert!((0.31..0.36).contains(&share), "share was {share}");
        }
    }
}
