//! Crash, conflict and lifecycle handling

use postgres_storage_operator::controller::condition_types::DISK_USAGE_STALE;
use postgres_storage_operator::controller::{EventReason, TickOutcome};
use postgres_storage_operator::crd::{IntentStage, ResizeOutcome, ResizePhase, VolumeRole};

use crate::common::*;

mod crash_tests {
    use super::*;

    #[tokio::test]
    async fn test_claim_is_not_patched_without_recorded_intent() {
        let h = Harness::new(create_resizable_cluster("pg", "db"));
        h.probe.set_usage(&h.instance(0), VolumeRole::Data, 85.0);
        h.cluster.fail_after(0);

        let result = h.tick(t0()).await;

        assert!(result.is_err());
        assert!(h.volumes.patches().is_empty());
        assert!(h.status().pending.is_empty());
    }

    #[tokio::test]
    async fn test_interrupted_request_resumes_with_single_outcome() {
        let h = Harness::new(create_resizable_cluster("pg", "db"));
        let pg0 = h.instance(0);
        h.probe.set_usage(&pg0, VolumeRole::Data, 85.0);
        // The intent is written, the claim patched, then the final write is lost
        h.cluster.fail_after(1);

        assert!(h.tick(t0()).await.is_err());
        let status = h.status();
        assert_eq!(status.phase, ResizePhase::Requesting);
        assert_eq!(status.pending.len(), 1);
        assert_eq!(status.pending[0].stage, IntentStage::Requesting);
        assert!(status.auto_resize_history.is_empty());
        assert_eq!(h.volumes.patches().len(), 1);

        let report = h.completed_tick(at_minute(1)).await;

        assert_eq!(report.phase, ResizePhase::AwaitingPropagation);
        assert_eq!(h.volumes.patches().len(), 1);
        let status = h.status();
        assert_eq!(status.auto_resize_history.len(), 1);
        assert_eq!(status.auto_resize_history[0].outcome, ResizeOutcome::Applied);
        assert_eq!(status.auto_resize_history[0].id, status.pending[0].id);

        // Replaying the same tick does not record the outcome again
        h.completed_tick(at_minute(2)).await;
        assert_eq!(h.status().auto_resize_history.len(), 1);
    }
}

mod conflict_tests {
    use super::*;

    #[tokio::test]
    async fn test_conflicting_write_restarts_tick() {
        let h = Harness::new(create_resizable_cluster("pg", "db"));
        h.probe.set_usage(&h.instance(0), VolumeRole::Data, 85.0);
        h.cluster.inject_conflicts(1);

        let report = h.completed_tick(t0()).await;

        assert_eq!(report.outcomes, vec![(VolumeRole::Data, ResizeOutcome::Applied)]);
        assert_eq!(h.volumes.patches().len(), 1);
        assert_eq!(h.status().auto_resize_history.len(), 1);
        assert_eq!(h.events.count(EventReason::AutoResizeTriggered), 1);
    }

    #[tokio::test]
    async fn test_persistent_conflicts_give_up() {
        let h = Harness::new(create_resizable_cluster("pg", "db"));
        h.probe.set_usage(&h.instance(0), VolumeRole::Data, 85.0);
        h.cluster.inject_conflicts(10);

        let err = h.tick(t0()).await.unwrap_err();

        assert!(err.is_conflict());
        assert!(h.volumes.patches().is_empty());
        assert!(h.events.all().is_empty());
    }
}

mod lifecycle_tests {
    use super::*;

    #[tokio::test]
    async fn test_hibernation_freezes_propagation() {
        let h = Harness::new(create_resizable_cluster("pg", "db"));
        let pg0 = h.instance(0);
        h.probe.set_usage(&pg0, VolumeRole::Data, 85.0);
        h.completed_tick(t0()).await;
        let before = h.status();
        let calls = h.probe.calls();

        h.cluster.set_hibernated(true);
        h.volumes.propagate_all();
        let outcome = h.tick(at_minute(1)).await.unwrap();

        assert_eq!(outcome, TickOutcome::Suspended);
        assert_eq!(h.status(), before);
        assert_eq!(h.probe.calls(), calls);

        h.cluster.set_hibernated(false);
        let report = h.completed_tick(at_minute(2)).await;
        assert_eq!(report.phase, ResizePhase::Idle);
        assert!(h.status().pending.is_empty());
        assert_eq!(h.events.count(EventReason::AutoResizeSuccess), 1);
    }

    #[tokio::test]
    async fn test_deleted_cluster_is_abandoned() {
        let h = Harness::new(create_resizable_cluster("pg", "db"));
        h.cluster.delete();

        assert_eq!(h.tick(t0()).await.unwrap(), TickOutcome::Abandoned);
        assert_eq!(h.probe.calls(), 0);
    }

    #[tokio::test]
    async fn test_terminating_cluster_is_abandoned() {
        let h = Harness::new(create_resizable_cluster("pg", "db"));
        h.probe.set_usage(&h.instance(0), VolumeRole::Data, 95.0);
        h.cluster.mark_terminating();

        assert_eq!(h.tick(t0()).await.unwrap(), TickOutcome::Abandoned);
        assert_eq!(h.cluster.persists(), 0);
        assert!(h.volumes.patches().is_empty());
    }
}

mod stale_tests {
    use super::*;

    #[tokio::test]
    async fn test_repeated_probe_failures_raise_stale_condition() {
        let h = Harness::new(create_resizable_cluster("pg", "db"));
        let pg0 = h.instance(0);
        h.probe.set_usage(&pg0, VolumeRole::Data, 50.0);
        h.completed_tick(t0()).await;

        h.probe.fail(&pg0, VolumeRole::Data);
        for minute in 1..3 {
            h.completed_tick(at_minute(minute)).await;
        }
        let condition = h.status().condition(DISK_USAGE_STALE).cloned().unwrap();
        assert_eq!(condition.status, "False");

        h.completed_tick(at_minute(3)).await;
        let status = h.status();
        let volume = &status.instances[&pg0].data_volume;
        assert!(volume.stale);
        assert_eq!(volume.consecutive_failures, 3);
        assert_eq!(volume.percent_used, 50.0);
        let condition = status.condition(DISK_USAGE_STALE).cloned().unwrap();
        assert_eq!(condition.status, "True");

        h.probe.set_usage(&pg0, VolumeRole::Data, 51.0);
        h.completed_tick(at_minute(4)).await;
        let condition = h.status().condition(DISK_USAGE_STALE).cloned().unwrap();
        assert_eq!(condition.status, "False");
        assert!(!h.status().instances[&pg0].data_volume.stale);
    }

    #[tokio::test]
    async fn test_stale_volume_never_triggers() {
        let h = Harness::new(create_resizable_cluster("pg", "db"));
        let pg0 = h.instance(0);
        h.probe.set_usage(&pg0, VolumeRole::Data, 79.0);
        h.completed_tick(t0()).await;

        h.probe.fail(&pg0, VolumeRole::Data);
        for minute in 1..5 {
            h.completed_tick(at_minute(minute)).await;
        }

        assert!(h.volumes.patches().is_empty());
        assert!(h.status().auto_resize_history.is_empty());
    }

    #[tokio::test]
    async fn test_out_of_order_sample_is_ignored() {
        let h = Harness::new(create_resizable_cluster("pg", "db"));
        let pg0 = h.instance(0);
        h.probe.set_usage(&pg0, VolumeRole::Data, 60.0);
        h.completed_tick(at_minute(5)).await;

        // A delayed reading taken before the recorded one
        h.probe.set_usage(&pg0, VolumeRole::Data, 85.0);
        h.probe.set_clock(at_minute(2));
        h.coordinator.tick(&h.key, at_minute(6)).await.unwrap();

        assert_eq!(h.status().instances[&pg0].data_volume.percent_used, 60.0);
        assert!(h.volumes.patches().is_empty());
    }
}
