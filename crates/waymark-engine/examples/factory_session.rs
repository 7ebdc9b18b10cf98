//! Headless walkthrough of a Waymark session.
//!
//! Bakes a small factory floor to a store file in the system temp directory,
//! then simulates a second run of the host: the scene is loaded fresh, one
//! machine has been removed and another nudged, and the session reconciles the
//! loaded scene back to its baked state over a simulated frame loop.
//!
//! Run with:
//!   cargo run --example factory_session -p waymark-engine
//!
//! Set `RUST_LOG=waymark_engine=debug` to watch the passes step.

use std::time::Duration;

use anyhow::Context;
use waymark_engine::prelude::*;

const FRAME: Duration = Duration::from_millis(16);

// ---------------------------------------------------------------------------
// Scene
// ---------------------------------------------------------------------------

fn load_floor() -> anyhow::Result<SceneTree> {
    let mut scene = SceneTree::new("Factory");
    let mut floor = NodeTemplate::new("Floor");
    for line in 0..3 {
        let mut l = NodeTemplate::new(format!("Line{line}"));
        for slot in 0..4 {
            l = l.child(
                NodeTemplate::new(format!("Press{slot}"))
                    .with(Component::renderer("mesh/press"))
                    .with(Component::collider())
                    .at(Vec3::new(slot as f32 * 3.0, 0.0, line as f32 * 6.0)),
            );
        }
        floor = floor.child(l);
    }
    scene.spawn(&floor, None)?;
    scene.spawn(&NodeTemplate::new("Main Camera").with(Component::camera()), None)?;
    scene.register_prefab(
        "prefabs/crate",
        NodeTemplate::new("Crate").with(Component::renderer("mesh/crate")),
    );
    Ok(scene)
}

/// Drive the session until it reports something.
fn run_frames(session: &mut Session, scene: &mut SceneTree) -> anyhow::Result<SessionEvent> {
    for _ in 0..100_000 {
        if let Some(event) = session.tick(FRAME, scene) {
            return Ok(event);
        }
    }
    anyhow::bail!("session never finished")
}

// ---------------------------------------------------------------------------
// Notifier
// ---------------------------------------------------------------------------

struct StdoutNotifier;

impl Notifier for StdoutNotifier {
    fn notify(&self, title: &str, text: &str, is_error: bool) {
        let marker = if is_error { "!" } else { "*" };
        println!("  [{marker}] {title}: {text}");
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let dir = std::env::temp_dir().join("waymark-factory-demo");
    std::fs::create_dir_all(&dir).with_context(|| format!("creating {}", dir.display()))?;
    let config = WaymarkConfig {
        store_path: dir.join("waymark_store.json"),
        settle_delay_ms: 500,
        retry_interval_ms: 250,
        max_retries: 2,
        ..Default::default()
    };
    config.validate()?;
    if config.store_path.exists() {
        std::fs::remove_file(&config.store_path)?;
    }

    // -- first run: bake and record a spawn --------------------------------
    println!("== first run ==");
    {
        let mut session =
            Session::open(config.clone())?.with_notifier(Box::new(StdoutNotifier));
        let mut scene = load_floor()?;

        session.start_baking(&scene)?;
        match run_frames(&mut session, &mut scene)? {
            SessionEvent::BakeFinished(report) => {
                println!(
                    "  baked {} of {} nodes, histogram {:?}",
                    report.baked, report.total_nodes, report.histogram
                );
            }
            other => anyhow::bail!("unexpected event {other:?}"),
        }

        let line1 = scene
            .find_by_path("Floor/Line1")
            .context("line 1 should exist")?;
        let (_, key) = session.spawn(
            &mut scene,
            "prefabs/crate",
            Some(line1),
            Transform::from_position(Vec3::new(1.5, 0.0, 0.0)),
        )?;
        println!("  spawned a crate as {key}");
        session.save()?;
    }

    // -- second run: the scene comes back slightly different ---------------
    println!("== second run ==");
    let mut session = Session::open(config)?.with_notifier(Box::new(StdoutNotifier));
    let mut scene = load_floor()?;

    let gone = scene
        .find_by_path("Floor/Line2/Press3")
        .context("press should exist")?;
    scene.destroy(gone)?;
    let nudged = scene
        .find_by_path("Floor/Line0/Press0")
        .context("press should exist")?;
    scene.set_local_transform(nudged, Transform::from_position(Vec3::new(9.0, 0.0, 9.0)))?;

    session.on_scene_loaded(scene.scene_name());
    match run_frames(&mut session, &mut scene)? {
        SessionEvent::ReconcileFinished(report) => {
            println!(
                "  applied {} ({} moved, {} spawned) in {} round(s)",
                report.applied, report.moved, report.spawned, report.rounds
            );
            for miss in &report.missed {
                println!("  missed {}: {}", miss.item_path, miss.reason);
            }
        }
        other => anyhow::bail!("unexpected event {other:?}"),
    }
    println!("{}", session.diagnostics().summary());

    Ok(())
}
