#[cfg(test)]
mod tests {
    use weft_core::*;

    // ── Device tests ───────────────────────────────────────────

    #[test]
    fn test_device_constructor_derives_hostname() {
        let d = Device::new("abc-123", "phone", "pocket", "weft");
        assert_eq!(d.hostname, "weft-phone-abc-123");
        assert_eq!(d.status, DeviceStatus::Offline);
        assert!(d.role.is_none());
        assert!(!d.is_primary());
    }

    #[test]
    fn test_parse_hostname_with_dashed_id() {
        let (ty, id) = parse_hostname("myapp", "myapp-desktop-abc-123-def").unwrap();
        assert_eq!(ty, "desktop");
        assert_eq!(id, "abc-123-def");
    }

    #[test]
    fn test_parse_hostname_rejects_foreign_names() {
        assert!(parse_hostname("myapp", "myapp-desktop").is_none());
        assert!(parse_hostname("myapp", "laptop-1").is_none());
        assert!(parse_hostname("myapp", "").is_none());
    }

    #[test]
    fn test_role_serde_variants() {
        for role in [DeviceRole::Primary, DeviceRole::Secondary] {
            let json = serde_json::to_string(&role).unwrap();
            let restored: DeviceRole = serde_json::from_str(&json).unwrap();
            assert_eq!(role, restored);
        }
        assert_eq!(
            serde_json::to_string(&DeviceRole::Primary).unwrap(),
            "\"primary\""
        );
    }

    // ── Envelope tests ─────────────────────────────────────────

    #[test]
    fn test_envelope_serde_roundtrip() {
        let env = Envelope::new("tasks", "created", serde_json::json!({"items": ["a"]}));
        let json = serde_json::to_string(&env).unwrap();
        let restored: Envelope = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, env);
        assert!(!env.is_control());
    }

    #[test]
    fn test_mesh_namespace_is_control() {
        let env = Envelope::new(MESH_NAMESPACE, "ping", serde_json::json!({}));
        assert!(env.is_control());
    }

    // ── Control-plane message tests ────────────────────────────

    #[test]
    fn test_device_list_roundtrip() {
        let a = Device::new("dev-a", "desktop", "a", "weft");
        let b = Device::new("dev-b", "phone", "b", "weft");
        let msg = MeshMessage::new(
            "dev-a",
            MeshPayload::DeviceList {
                devices: vec![a, b],
                primary_id: Some("dev-a".into()),
            },
        );
        let env = msg.clone().into_envelope().unwrap();
        assert_eq!(env.namespace, MESH_NAMESPACE);
        assert_eq!(env.kind, "message");
        let back = MeshMessage::from_envelope(&env).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn test_directed_message_keeps_to_field() {
        let msg = MeshMessage::new("dev-b", MeshPayload::ElectionStart {}).to("dev-a");
        let v = serde_json::to_value(&msg).unwrap();
        assert_eq!(v["to"], "dev-a");
        assert_eq!(v["from"], "dev-b");
    }

    #[test]
    fn test_route_message_wire_shape() {
        let inner = Envelope::new("events", "x", serde_json::json!({"v": 1}));
        let route = RouteMessage {
            target_device_id: "dev-c".into(),
            envelope: inner.clone(),
        };
        let v = serde_json::to_value(&route).unwrap();
        assert_eq!(v["targetDeviceId"], "dev-c");
        let back: RouteMessage = serde_json::from_value(v).unwrap();
        assert_eq!(back.envelope, inner);
    }

    #[test]
    fn test_candidate_wire_shape() {
        let c = Candidate {
            device_id: "dev-a".into(),
            uptime: 120_000,
            user_designated: false,
        };
        let v = serde_json::to_value(&c).unwrap();
        assert_eq!(v["deviceId"], "dev-a");
        assert_eq!(v["userDesignated"], false);
    }

    // ── Error tests ────────────────────────────────────────────

    #[test]
    fn test_error_display() {
        let err = WeftError::FrameTooLarge {
            len: 17_000_000,
            max: 16 * 1024 * 1024,
        };
        assert!(err.to_string().contains("17000000"));

        let err = WeftError::DialError {
            device_id: "dev-b".into(),
            reason: "no route".into(),
        };
        assert!(err.to_string().contains("dev-b"));
        assert!(err.to_string().contains("no route"));
    }

    // ── Event bus tests ────────────────────────────────────────

    #[tokio::test]
    async fn test_event_bus_fanout() {
        let bus = EventBus::new(16);
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();
        bus.publish(MeshEvent::PrimaryChanged {
            primary_id: Some("dev-a".into()),
        });
        assert!(matches!(
            rx1.recv().await.unwrap(),
            MeshEvent::PrimaryChanged { .. }
        ));
        assert!(matches!(
            rx2.recv().await.unwrap(),
            MeshEvent::PrimaryChanged { .. }
        ));
    }

    #[test]
    fn test_event_bus_without_subscribers_is_noop() {
        let bus = EventBus::default();
        bus.publish(MeshEvent::DeviceOffline {
            device_id: "dev-x".into(),
        });
    }
}
