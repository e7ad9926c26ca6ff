// Test code is allowed to panic on failure
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic,
    clippy::string_slice
)]

//! Property-based tests for the storage auto-resizer
//!
//! These tests use proptest to generate usage histories and policies and
//! verify that:
//! 1. Requested and committed sizes never shrink
//! 2. No request ever exceeds the configured limit
//! 3. A volume that stays between the threshold and the emergency level is
//!    grown exactly once
//! 4. The pure decision functions hold their bounds for any input

#[path = "../common/mod.rs"]
mod common;

use proptest::prelude::*;

use common::*;
use postgres_storage_operator::autoresize::{
    ClampOutcome, ResizePolicy, allow, clamp, target_size,
};
use postgres_storage_operator::crd::{
    ResizeEvent, ResizeOutcome, ResizeSpec, VolumeRole,
};

// =============================================================================
// Helpers
// =============================================================================

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

/// One step of a generated history: the usage reported, and whether the
/// backend finishes outstanding resizes before the tick
#[derive(Clone, Debug)]
struct Step {
    percent: f64,
    propagate: bool,
}

fn step_strategy() -> impl Strategy<Value = Step> {
    (0.0f64..100.0, any::<bool>()).prop_map(|(percent, propagate)| Step { percent, propagate })
}

/// Drive a single-member cluster through `steps`, one tick every ten minutes.
///
/// Returns the requested size of the data claim after every tick.
fn run_history(resize: ResizeSpec, steps: &[Step]) -> (Harness, Vec<u64>) {
    let cluster = PostgresClusterBuilder::new("pg", "db")
        .with_storage("2Gi")
        .with_resize(resize)
        .build();
    let h = Harness::new(cluster);
    let pg0 = h.instance(0);
    let mut requested = Vec::with_capacity(steps.len());

    runtime().block_on(async {
        for (i, step) in steps.iter().enumerate() {
            if step.propagate {
                h.volumes.propagate_all();
            }
            h.probe.set_usage(&pg0, VolumeRole::Data, step.percent);
            h.completed_tick(at_minute(i as i64 * 10)).await;
            requested.push(h.volumes.requested(&pg0, VolumeRole::Data).unwrap());
        }
    });

    (h, requested)
}

fn event(at_minute_offset: i64, outcome: ResizeOutcome) -> ResizeEvent {
    ResizeEvent {
        id: format!("e{}", at_minute_offset),
        volume_role: VolumeRole::Data,
        requested_at: at_minute(at_minute_offset),
        from_size: GI,
        to_size: 2 * GI,
        outcome,
        trigger_instance: "pg-0".to_string(),
        message: None,
    }
}

// =============================================================================
// Coordinator properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    /// Requested sizes never decrease and committed sizes follow them
    #[test]
    fn sizes_are_monotonic(steps in prop::collection::vec(step_strategy(), 1..24)) {
        let (h, requested) = run_history(ResizeSpecBuilder::enabled().build(), &steps);

        prop_assert!(requested.windows(2).all(|w| w[0] <= w[1]), "{:?}", requested);
        prop_assert!(requested[0] >= 2 * GI);

        let status = h.status();
        let committed = status.instances[&h.instance(0)].data_volume.committed_size;
        prop_assert!(committed >= 2 * GI);
        prop_assert!(committed <= *requested.last().unwrap());
        for event in &status.auto_resize_history {
            prop_assert!(event.to_size > event.from_size, "{:?}", event);
        }
    }

    /// No request ever exceeds the limit
    #[test]
    fn limit_is_respected(
        limit_gi in 3u64..12,
        steps in prop::collection::vec(step_strategy(), 1..24),
    ) {
        let resize = ResizeSpecBuilder::enabled()
            .with_limit(&format!("{}Gi", limit_gi))
            .with_rate_limit(100, "24h")
            .build();
        let (h, requested) = run_history(resize, &steps);

        for size in &requested {
            prop_assert!(*size <= limit_gi * GI, "{} exceeds {}Gi", size, limit_gi);
        }
        for event in &h.status().auto_resize_history {
            prop_assert!(event.to_size <= limit_gi * GI);
        }
    }

    /// Usage hovering between threshold and emergency triggers exactly once
    #[test]
    fn sustained_usage_triggers_once(
        readings in prop::collection::vec(80.0f64..90.0, 2..16),
        propagate in prop::collection::vec(any::<bool>(), 16),
    ) {
        let steps: Vec<Step> = readings
            .iter()
            .zip(propagate)
            .map(|(percent, propagate)| Step { percent: *percent, propagate })
            .collect();
        let resize = ResizeSpecBuilder::enabled()
            .with_propagation_timeout("24h")
            .build();
        let (h, _) = run_history(resize, &steps);

        let history = h.status().auto_resize_history;
        prop_assert_eq!(history.len(), 1, "{:?}", history);
        prop_assert_eq!(history[0].outcome, ResizeOutcome::Applied);
        prop_assert_eq!(h.volumes.patches().len(), 1);
    }
}

// =============================================================================
// Decision function properties
// =============================================================================

proptest! {
    /// The target always grows by at least the minimum increment, lands on the
    /// granularity and respects the maximum increment
    #[test]
    fn target_size_bounds(
        committed in 1u64..(1u64 << 44),
        factor in 1.0f64..4.0,
        min_increment_mi in 1u64..4096,
        max_extra_mi in prop::option::of(0u64..8192),
    ) {
        let policy = ResizePolicy {
            growth_factor: factor,
            min_increment: min_increment_mi * MI,
            max_increment: max_extra_mi.map(|extra| (min_increment_mi + extra) * MI),
            ..Default::default()
        };
        let target = target_size(committed, &policy);

        prop_assert!(target >= committed + policy.min_increment);
        prop_assert_eq!(target % policy.granularity, 0);
        if let Some(max) = policy.max_increment {
            prop_assert!(target - committed < max + policy.granularity);
        }
    }

    /// Clamping never yields more than the ceiling, nor less than committed
    #[test]
    fn clamp_respects_ceiling(
        proposed in 0u64..(1u64 << 40),
        committed in 0u64..(1u64 << 40),
        max in prop::option::of(1u64..(1u64 << 40)),
    ) {
        match clamp(proposed, committed, max) {
            ClampOutcome::Allowed(size) => {
                prop_assert_eq!(size, proposed);
                prop_assert!(max.is_none_or(|m| size <= m));
            }
            ClampOutcome::Capped(size) => {
                prop_assert_eq!(Some(size), max);
                prop_assert!(size < proposed);
            }
            ClampOutcome::AtLimit(size) => {
                prop_assert_eq!(size, committed);
                prop_assert!(max.is_some_and(|m| committed >= m));
            }
        }
    }

    /// Within one window, non-emergency resizes never exceed the quota
    #[test]
    fn quota_is_never_exceeded(
        limit in 1u32..6,
        attempts in prop::collection::vec(0i64..(24 * 60), 1..40),
    ) {
        let policy = ResizePolicy {
            max_resizes_per_window: limit,
            ..Default::default()
        };
        let mut attempts = attempts;
        attempts.sort_unstable();
        let expected = attempts.len().min(limit as usize);

        let mut history = Vec::new();
        for minute in attempts {
            let now = at_minute(minute);
            if allow(&history, VolumeRole::Data, "pg-0", now, false, &policy).is_allowed() {
                history.push(event(minute, ResizeOutcome::Applied));
            }
        }

        // Every attempt falls inside one window, so the earliest ones win
        prop_assert_eq!(history.len(), expected);
    }
}
