//! Display, encoder, CRTC and writeback binding across whole devices.

use std::sync::Arc;

use kmsplan::compositor::{DisplayPipeline, PlanOptions};
use kmsplan::kms::virt::{HardwareDesc, ModeDesc, VirtualDevice};
use kmsplan::kms::{ConnectionState, KmsDevice};
use kmsplan::resources::{BindError, ResourceGraph, ResourceManager};
use kmsplan_config::{Config, PlannerKind};

fn device(json: &str) -> Arc<VirtualDevice> {
    Arc::new(VirtualDevice::new(HardwareDesc::from_json(json).unwrap()))
}

fn graph(dev: &Arc<VirtualDevice>) -> ResourceGraph {
    let device: Arc<dyn KmsDevice> = dev.clone();
    ResourceGraph::new(device, &[], 0).unwrap()
}

#[test]
fn writeback_is_attached_to_its_crtc() {
    let dev = device(
        r#"{
            "crtcs": [{}],
            "encoders": [
                { "possible_crtcs": [0], "possible_clones": [1] },
                { "possible_crtcs": [0] }
            ],
            "connectors": [
                { "kind": "HDMI-A", "encoders": [0] },
                { "kind": "Writeback", "encoders": [1] }
            ],
            "planes": [{ "type": "primary", "formats": ["XR24"] }]
        }"#,
    );
    let mut g = graph(&dev);

    assert_eq!(g.displays(), [0]);
    assert_eq!(g.writeback_connectors().len(), 1);

    let wb = g.writeback_for_display(0).unwrap();
    assert!(wb.is_writeback());
    let wb_id = wb.id();
    let enc = g.encoder(wb.encoder().unwrap()).unwrap();
    assert_eq!(enc.crtc(), Some(g.crtc_for_display(0).unwrap().id()));

    // Cloned with the display's encoder, so it can capture right away.
    assert_eq!(g.available_writeback_connector(0).map(|c| c.id()), Some(wb_id));

    let err = g.attach_writeback(0).unwrap_err();
    assert!(matches!(err, BindError::WritebackAttached { display: 0 }));
}

#[test]
fn writeback_is_borrowed_from_an_idle_crtc() {
    let dev = device(
        r#"{
            "crtcs": [{}, {}],
            "encoders": [
                { "possible_crtcs": [0] },
                { "possible_crtcs": [1] }
            ],
            "connectors": [
                { "kind": "eDP", "encoders": [0] },
                { "kind": "Writeback", "encoders": [1] }
            ],
            "planes": [{ "type": "primary", "formats": ["XR24"] }]
        }"#,
    );
    let mut g = graph(&dev);

    assert!(g.writeback_for_display(0).is_none());
    assert!(matches!(
        g.attach_writeback(0),
        Err(BindError::NoWriteback { display: 0 })
    ));

    let wb = g.available_writeback_connector(0).unwrap();
    assert_eq!(wb.name(), "Writeback-1");
}

#[test]
fn encoders_are_never_stolen() {
    // Both connectors can only use the one encoder.
    let dev = device(
        r#"{
            "crtcs": [{}, {}],
            "encoders": [{ "possible_crtcs": [0, 1] }],
            "connectors": [
                { "kind": "eDP", "encoders": [0] },
                { "kind": "DP", "encoders": [0] }
            ],
            "planes": [
                { "type": "primary", "formats": ["XR24"], "possible_crtcs": [0] },
                { "type": "primary", "formats": ["XR24"], "possible_crtcs": [1] }
            ]
        }"#,
    );
    let g = graph(&dev);

    assert_eq!(g.displays(), [0, 1]);
    assert_eq!(g.connector_for_display(0).unwrap().name(), "eDP-1");
    assert!(g.crtc_for_display(0).is_some());
    assert!(g.crtc_for_display(1).is_none());

    let err = DisplayPipeline::new(&g, 1, PlannerKind::Greedy, PlanOptions::default())
        .err()
        .unwrap();
    assert!(matches!(err, BindError::NotBound { display: 1 }));
}

#[test]
fn current_encoder_and_crtc_are_kept() {
    let dev = device(
        r#"{
            "crtcs": [{}, {}],
            "encoders": [{ "possible_crtcs": [0, 1], "crtc": 1 }],
            "connectors": [{ "kind": "eDP", "encoders": [0], "encoder": 0 }],
            "planes": [{ "type": "primary", "formats": ["XR24"], "possible_crtcs": [0, 1] }]
        }"#,
    );
    let g = graph(&dev);

    let crtc = g.crtc_for_display(0).unwrap();
    assert_eq!(crtc.pipe(), 1);
}

#[test]
fn mode_ids_survive_hotplug() {
    let dev = device(
        r#"{
            "crtcs": [{}],
            "encoders": [{ "possible_crtcs": [0] }],
            "connectors": [
                { "kind": "DP", "encoders": [0],
                  "modes": [
                    { "width": 1280, "height": 720 },
                    { "width": 1920, "height": 1080, "preferred": true }
                  ] }
            ],
            "planes": [{ "type": "primary", "formats": ["XR24"] }]
        }"#,
    );
    let mut g = graph(&dev);

    let conn = g.connector_for_display(0).unwrap();
    let hd = conn.modes()[0].id;
    let full_hd = conn.modes()[1].id;
    assert_ne!(hd, full_hd);
    assert_eq!(conn.preferred_mode().unwrap().id, full_hd);

    let mut uhd = ModeDesc::new(3840, 2160);
    uhd.preferred = true;
    dev.hotplug(
        0,
        ConnectionState::Connected,
        &[ModeDesc::new(1920, 1080), uhd],
    );
    g.update_modes(0).unwrap();

    let conn = g.connector_for_display(0).unwrap();
    let ids: Vec<u32> = conn.modes().iter().map(|m| m.id).collect();
    assert_eq!(ids[0], full_hd);
    assert!(!ids.contains(&hd));
    assert!(ids[1] > full_hd);
    assert_eq!(conn.preferred_mode().unwrap().id, ids[1]);

    dev.hotplug(0, ConnectionState::Disconnected, &[]);
    g.update_modes(0).unwrap();
    let conn = g.connector_for_display(0).unwrap();
    assert!(!conn.is_connected());
    assert!(conn.modes().is_empty());
    assert!(conn.preferred_mode().is_none());
}

#[test]
fn displays_are_numbered_across_devices() {
    let one = r#"{
        "crtcs": [{}],
        "encoders": [{ "possible_crtcs": [0] }],
        "connectors": [{ "kind": "eDP", "encoders": [0] }],
        "planes": [{ "type": "primary", "formats": ["XR24"] }]
    }"#;
    let two = r#"{
        "crtcs": [{}, {}],
        "encoders": [{ "possible_crtcs": [0] }, { "possible_crtcs": [1] }],
        "connectors": [
            { "kind": "HDMI-A", "encoders": [0] },
            { "kind": "DP", "encoders": [1] }
        ],
        "planes": [
            { "type": "primary", "formats": ["XR24"], "possible_crtcs": [0] },
            { "type": "primary", "formats": ["XR24"], "possible_crtcs": [1] }
        ]
    }"#;
    let no_crtc = r#"{
        "crtcs": [],
        "encoders": [],
        "connectors": [],
        "planes": []
    }"#;

    let devices: Vec<Arc<dyn KmsDevice>> = vec![device(one), device(no_crtc), device(two)];
    let manager = ResourceManager::from_devices(devices, &Config::default()).unwrap();

    assert_eq!(manager.graphs().len(), 2);
    assert_eq!(manager.num_displays(), 3);
    assert_eq!(manager.graphs()[1].displays(), [1, 2]);

    let g = manager.graph_for_display(2).unwrap();
    assert_eq!(g.connector_for_display(2).unwrap().name(), "DP-1");
    assert!(manager.graph_for_display(3).is_none());
}

#[test]
fn no_usable_device_is_an_error() {
    assert!(ResourceManager::from_devices(Vec::new(), &Config::default()).is_err());
}
