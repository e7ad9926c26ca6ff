//! WAL safety and storage class gates

use postgres_storage_operator::autoresize::WalHealth;
use postgres_storage_operator::autoresize::wal_safety::InactiveSlot;
use postgres_storage_operator::controller::EventReason;
use postgres_storage_operator::controller::condition_types::RESIZE_BLOCKED;
use postgres_storage_operator::crd::{ResizeOutcome, TriggerState, VolumeRole};

use crate::common::*;

fn healthy() -> WalHealth {
    WalHealth {
        archive_healthy: true,
        pending_wal_files: 0,
        inactive_slots: Vec::new(),
    }
}

fn blocked_reason(h: &Harness) -> String {
    let condition = h.status().condition(RESIZE_BLOCKED).cloned().unwrap();
    assert_eq!(condition.status, "True");
    condition.reason
}

mod wal_safety_tests {
    use super::*;

    #[tokio::test]
    async fn test_single_volume_requires_acknowledgement() {
        let cluster = PostgresClusterBuilder::new("pg", "db")
            .single_volume()
            .with_resize(ResizeSpecBuilder::enabled().build())
            .build();
        let h = Harness::new(cluster);
        let pg0 = h.instance(0);
        h.probe.set_usage(&pg0, VolumeRole::Data, 85.0);

        let report = h.completed_tick(t0()).await;

        assert_eq!(report.outcomes, vec![(VolumeRole::Data, ResizeOutcome::Blocked)]);
        assert!(h.volumes.patches().is_empty());
        assert_eq!(h.events.count(EventReason::AutoResizeBlocked), 1);
        assert_eq!(blocked_reason(&h), "WALSafety");
        assert!(
            h.status().auto_resize_history[0]
                .message
                .as_deref()
                .unwrap()
                .contains("acknowledgeWALRisk")
        );
        assert_eq!(
            h.status().instances[&pg0].data_volume.trigger_state,
            TriggerState::Blocked
        );
    }

    #[tokio::test]
    async fn test_acknowledged_single_volume_grows() {
        let cluster = PostgresClusterBuilder::new("pg", "db")
            .single_volume()
            .with_resize(ResizeSpecBuilder::enabled().acknowledge_wal_risk().build())
            .build();
        let h = Harness::new(cluster);
        let pg0 = h.instance(0);
        h.probe.set_usage(&pg0, VolumeRole::Data, 85.0);
        h.probe.set_wal_health(&pg0, healthy());

        let report = h.completed_tick(t0()).await;

        assert_eq!(report.outcomes, vec![(VolumeRole::Data, ResizeOutcome::Applied)]);
        assert_eq!(h.volumes.requested(&pg0, VolumeRole::Data), Some(3 * GI));
    }

    #[tokio::test]
    async fn test_pending_wal_backlog_blocks_resize() {
        let cluster = PostgresClusterBuilder::new("pg", "db")
            .single_volume()
            .with_resize(
                ResizeSpecBuilder::enabled()
                    .acknowledge_wal_risk()
                    .with_max_pending_wal_files(50)
                    .build(),
            )
            .build();
        let h = Harness::new(cluster);
        let pg0 = h.instance(0);
        h.probe.set_usage(&pg0, VolumeRole::Data, 85.0);
        h.probe.set_wal_health(
            &pg0,
            WalHealth {
                pending_wal_files: 120,
                ..healthy()
            },
        );

        let report = h.completed_tick(t0()).await;

        assert_eq!(report.outcomes, vec![(VolumeRole::Data, ResizeOutcome::Blocked)]);
        assert!(h.volumes.patches().is_empty());
        assert_eq!(blocked_reason(&h), "WALSafety");
    }

    #[tokio::test]
    async fn test_failing_archive_blocks_wal_volume() {
        let cluster = PostgresClusterBuilder::new("pg", "db")
            .with_wal_storage("2Gi", Some(ResizeSpecBuilder::enabled().build()))
            .build();
        let h = Harness::new(cluster);
        let pg0 = h.instance(0);
        h.probe.set_usage(&pg0, VolumeRole::Wal, 85.0);
        h.probe.set_wal_health(
            &pg0,
            WalHealth {
                archive_healthy: false,
                ..healthy()
            },
        );

        h.completed_tick(t0()).await;
        assert!(h.volumes.patches().is_empty());

        // Archiving recovers; the blocked volume is retried on the next tick
        h.probe.set_wal_health(&pg0, healthy());
        let report = h.completed_tick(at_minute(1)).await;

        assert_eq!(report.outcomes, vec![(VolumeRole::Wal, ResizeOutcome::Applied)]);
        assert_eq!(h.volumes.requested(&pg0, VolumeRole::Wal), Some(3 * GI));
        let condition = h.status().condition(RESIZE_BLOCKED).cloned().unwrap();
        assert_eq!(condition.status, "False");
    }

    #[tokio::test]
    async fn test_inactive_slot_retention_blocks_wal_volume() {
        let mut resize = ResizeSpecBuilder::enabled().build();
        resize
            .strategy
            .get_or_insert_with(Default::default)
            .wal_safety_policy
            .get_or_insert_with(Default::default)
            .max_slot_retention_bytes = Some(GI as i64);
        let cluster = PostgresClusterBuilder::new("pg", "db")
            .with_wal_storage("2Gi", Some(resize))
            .build();
        let h = Harness::new(cluster);
        let pg0 = h.instance(0);
        h.probe.set_usage(&pg0, VolumeRole::Wal, 85.0);
        h.probe.set_wal_health(
            &pg0,
            WalHealth {
                inactive_slots: vec![InactiveSlot {
                    slot_name: "standby_east".to_string(),
                    retention_bytes: 3 * GI as i64,
                }],
                ..healthy()
            },
        );

        let report = h.completed_tick(t0()).await;

        assert_eq!(report.outcomes, vec![(VolumeRole::Wal, ResizeOutcome::Blocked)]);
        let condition = h.status().condition(RESIZE_BLOCKED).cloned().unwrap();
        assert!(condition.message.contains("standby_east"));
    }

    #[tokio::test]
    async fn test_missing_wal_health_does_not_block() {
        let cluster = PostgresClusterBuilder::new("pg", "db")
            .with_wal_storage("2Gi", Some(ResizeSpecBuilder::enabled().build()))
            .build();
        let h = Harness::new(cluster);
        h.probe.set_usage(&h.instance(0), VolumeRole::Wal, 85.0);

        let report = h.completed_tick(t0()).await;

        assert_eq!(report.outcomes, vec![(VolumeRole::Wal, ResizeOutcome::Applied)]);
    }
}

mod storage_class_tests {
    use super::*;

    #[tokio::test]
    async fn test_non_expandable_class_blocks_resize() {
        let h = Harness::new(create_resizable_cluster("pg", "db"));
        let pg0 = h.instance(0);
        h.volumes.set_expandable(None, false);
        h.probe.set_usage(&pg0, VolumeRole::Data, 85.0);

        let report = h.completed_tick(t0()).await;

        assert_eq!(report.outcomes, vec![(VolumeRole::Data, ResizeOutcome::Blocked)]);
        assert!(h.volumes.patches().is_empty());
        assert!(h.status().pending.is_empty());
        assert_eq!(blocked_reason(&h), "StorageNotExpandable");
    }

    #[tokio::test]
    async fn test_blocked_volume_is_not_recorded_twice() {
        let h = Harness::new(create_resizable_cluster("pg", "db"));
        h.volumes.set_expandable(None, false);
        h.probe.set_usage(&h.instance(0), VolumeRole::Data, 85.0);

        for minute in 0..4 {
            h.completed_tick(at_minute(minute)).await;
        }

        assert_eq!(h.status().auto_resize_history.len(), 1);
        assert_eq!(h.events.count(EventReason::AutoResizeBlocked), 1);
        assert_eq!(h.events.count(EventReason::AutoResizeTriggered), 1);
    }

    #[tokio::test]
    async fn test_blocked_volume_resumes_once_class_allows_expansion() {
        let h = Harness::new(create_resizable_cluster("pg", "db"));
        let pg0 = h.instance(0);
        h.volumes.set_expandable(None, false);
        h.probe.set_usage(&pg0, VolumeRole::Data, 85.0);
        h.completed_tick(t0()).await;

        h.volumes.set_expandable(None, true);
        let report = h.completed_tick(at_minute(1)).await;

        assert_eq!(report.outcomes, vec![(VolumeRole::Data, ResizeOutcome::Applied)]);
        assert_eq!(h.volumes.requested(&pg0, VolumeRole::Data), Some(3 * GI));
    }
}

mod claim_tests {
    use super::*;

    #[tokio::test]
    async fn test_unreadable_claim_does_not_stop_other_volumes() {
        let h = Harness::new(
            PostgresClusterBuilder::new("pg", "db")
                .with_replicas(2)
                .with_resize(ResizeSpecBuilder::enabled().build())
                .build(),
        );
        let (pg0, pg1) = (h.instance(0), h.instance(1));
        h.probe.set_usage(&pg0, VolumeRole::Data, 85.0);
        h.probe.set_usage(&pg1, VolumeRole::Data, 85.0);
        h.volumes.set_malformed(&pg1, VolumeRole::Data, true);

        let report = h.completed_tick(t0()).await;

        assert_eq!(report.outcomes, vec![(VolumeRole::Data, ResizeOutcome::Applied)]);
        assert_eq!(
            h.volumes.patches(),
            vec![(pg0.clone(), VolumeRole::Data, 3 * GI)]
        );
        assert!(h.volumes.provisioned().is_empty());
        assert_eq!(blocked_reason(&h), "InvalidVolumeClaim");
        let condition = h.status().condition(RESIZE_BLOCKED).cloned().unwrap();
        assert!(condition.message.contains(&pg1));

        // Once the claim is readable again it is evaluated like any other
        h.volumes.set_malformed(&pg1, VolumeRole::Data, false);
        let report = h.completed_tick(at_minute(1)).await;

        assert_eq!(report.outcomes, vec![(VolumeRole::Data, ResizeOutcome::Applied)]);
        assert_eq!(h.volumes.requested(&pg1, VolumeRole::Data), Some(3 * GI));
        let condition = h.status().condition(RESIZE_BLOCKED).cloned().unwrap();
        assert_eq!(condition.status, "False");
    }
}
