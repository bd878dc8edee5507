use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use glam::Vec3;
use tracing_subscriber::EnvFilter;

use farfield_archive::{ArchiveBuilder, ArchiveSet};
use farfield_assets::{BakedStore, ImpostorArtifact, MergedMeshArtifact, SyntheticDecoder};
use farfield_common::{
    CellCoord, NodeKind, PlacementRecord, PrototypeDescription, PrototypeId, RefId,
    SceneDescription, Transform, VariantId, CELL_SIZE,
};
use farfield_stream::{
    terrain_control_path, terrain_heightmap_path, NullTerrainEngine, RecordingSceneGraph,
    StaticWorldDatabase, StreamConfig, StreamContext, StreamingCoordinator, Viewpoint,
};

#[derive(Parser)]
#[command(name = "farfield-cli", about = "Headless driver for the farfield streaming engine")]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print engine version and crate info
    Info,
    /// Sweep a viewpoint across a synthetic world and report statistics
    Simulate {
        /// Number of frames to run
        #[arg(short, long, default_value = "240")]
        frames: u64,
        /// Half-extent of the authored world, in cells
        #[arg(short, long, default_value = "16")]
        extent: i32,
        /// Viewpoint speed in world units per frame
        #[arg(short, long, default_value = "10.0")]
        speed: f32,
        /// Streaming configuration file (JSON); defaults apply when omitted
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Pack a directory of asset files into an archive
    Pack {
        /// Directory to pack
        input: PathBuf,
        /// Output archive path
        output: PathBuf,
    },
    /// Bake distant-tier artifacts for a cell range into a store directory
    Bake {
        /// Baked store directory (created if absent)
        output: PathBuf,
        /// Inclusive cell range half-extent around the origin
        #[arg(short, long, default_value = "8")]
        extent: i32,
        /// Number of prototype impostors to bake
        #[arg(short, long, default_value = "4")]
        prototypes: u64,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .init();

    match cli.command {
        Commands::Info => {
            println!("farfield-cli v{}", env!("CARGO_PKG_VERSION"));
            println!("common: {}", farfield_common::crate_info());
            println!("archive: {}", farfield_archive::crate_info());
            println!("assets: {}", farfield_assets::crate_info());
            println!("sched: {}", farfield_sched::crate_info());
            println!("stream: {}", farfield_stream::crate_info());
        }
        Commands::Simulate {
            frames,
            extent,
            speed,
            config,
        } => simulate(frames, extent, speed, config.as_deref())?,
        Commands::Pack { input, output } => pack(&input, &output)?,
        Commands::Bake {
            output,
            extent,
            prototypes,
        } => bake(&output, extent, prototypes)?,
    }

    Ok(())
}

/// Deterministic per-cell variation without pulling in an RNG.
fn cell_salt(cell: CellCoord) -> u64 {
    (cell.x as i64 as u64)
        .wrapping_mul(0x9e37_79b9_7f4a_7c15)
        .wrapping_add(cell.y as i64 as u64)
}

fn simulate(frames: u64, extent: i32, speed: f32, config: Option<&Path>) -> anyhow::Result<()> {
    let config = match config {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading config {}", path.display()))?;
            serde_json::from_str(&text)
                .with_context(|| format!("parsing config {}", path.display()))?
        }
        None => StreamConfig::default(),
    };

    let work = tempfile::tempdir().context("creating scratch directory")?;

    // A handful of synthetic assets, one of them corrupt so the
    // placeholder path shows up in the report.
    let mut builder = ArchiveBuilder::new();
    builder.add("meshes/rock.bin", b"object:320:780".to_vec());
    builder.add("meshes/tree.bin", b"object:1200:2900".to_vec());
    builder.add("meshes/lantern.bin", b"light:40:90".to_vec());
    builder.add("meshes/broken.bin", b"!corrupt".to_vec());
    for x in -extent..=extent {
        for y in -extent..=extent {
            let cell = CellCoord::new(x, y);
            builder.add(terrain_heightmap_path(cell), vec![0; 64]);
            builder.add(terrain_control_path(cell), vec![0; 64]);
        }
    }
    let archive_path = work.path().join("world.farc");
    builder
        .write_to(&archive_path)
        .context("writing synthetic archive")?;

    let protos = [
        ("meshes/rock.bin", NodeKind::Object, false),
        ("meshes/tree.bin", NodeKind::Object, true),
        ("meshes/lantern.bin", NodeKind::Light, false),
        ("meshes/broken.bin", NodeKind::Object, false),
    ];
    let mut db = StaticWorldDatabase::new();
    for (n, (path, kind, common)) in protos.iter().enumerate() {
        db.add_prototype(PrototypeDescription {
            id: PrototypeId(n as u64 + 1),
            source_path: (*path).to_string(),
            variant: VariantId::BASE,
            kind: *kind,
            common: *common,
        });
    }

    let mut next_ref = 0u64;
    for x in -extent..=extent {
        for y in -extent..=extent {
            let cell = CellCoord::new(x, y);
            let salt = cell_salt(cell);
            // Mostly sparse cells; every 13th is a dense grove that
            // exercises the instancing path.
            let (proto, count) = if salt % 13 == 0 {
                (PrototypeId(2), 15)
            } else {
                (PrototypeId(1 + (salt % 4)), 1 + (salt % 3) as usize)
            };
            for i in 0..count {
                next_ref += 1;
                db.place(
                    cell,
                    PlacementRecord {
                        reference_id: RefId(next_ref),
                        base_object_id: proto,
                        transform: Transform {
                            position: cell.center()
                                + Vec3::new(i as f32 * 3.0, 0.0, (salt % 50) as f32),
                            ..Transform::default()
                        },
                    },
                );
            }
        }
    }
    tracing::info!(
        cells = db.cell_count(),
        placements = db.placement_count(),
        "synthetic world built"
    );

    // Baked artifacts for the distant tiers.
    let baked = BakedStore::open(work.path().join("baked")).context("opening baked store")?;
    for x in -extent..=extent {
        for y in -extent..=extent {
            let cell = CellCoord::new(x, y);
            baked.bake_merged_mesh(&MergedMeshArtifact {
                cell,
                scene: SceneDescription {
                    name: format!("merged_{}_{}", cell.x, cell.y),
                    kind: NodeKind::Object,
                    vertex_count: 600,
                    index_count: 1400,
                    approx_bytes: 600 * 32 + 1400 * 4,
                },
                source_placements: 3,
            })?;
        }
    }
    for id in 1..=3u64 {
        baked.bake_impostor(&ImpostorArtifact {
            prototype_id: PrototypeId(id),
            width: 64,
            height: 128,
            rgba: vec![0; 64 * 128 * 4],
            world_height: 10.0,
        })?;
    }

    let archives = ArchiveSet::open_all_with_budget(&[&archive_path], config.archive_cache_bytes)
        .context("opening archive")?;
    let ctx = StreamContext::new(
        config,
        Arc::new(db),
        Arc::new(archives),
        Arc::new(baked),
        Arc::new(SyntheticDecoder),
    );
    let mut coordinator = StreamingCoordinator::new(ctx);
    coordinator.set_terrain_engine(Box::new(NullTerrainEngine::default()));
    let mut graph = RecordingSceneGraph::new();

    let start = Vec3::new(-(extent as f32) * CELL_SIZE * 0.5, 0.0, 0.0);
    let forward = Vec3::new(1.0, 0.0, 0.0);
    for frame in 0..frames {
        let position = start + forward * (speed * frame as f32);
        coordinator.set_viewpoint(Viewpoint::new(position, forward), &mut graph);
        if frame % 60 == 0 {
            let s = coordinator.stats();
            tracing::info!(
                frame,
                near = s.near_loaded,
                mid = s.mid.attached,
                far = s.far.attached,
                pending = s.pending_tasks,
                "sweep progress"
            );
        }
        std::thread::sleep(std::time::Duration::from_millis(2));
    }

    let s = coordinator.stats();
    println!("frames:            {}", s.frames);
    println!("near loaded:       {}", s.near_loaded);
    println!("mid attached:      {} (empty {})", s.mid.attached, s.mid.empty);
    println!("far attached:      {} (empty {})", s.far.attached, s.far.empty);
    println!("live scene nodes:  {}", graph.live_count());
    println!("attach / detach:   {} / {}", graph.attach_count, graph.detach_count);
    println!("tasks submitted:   {}", s.tasks_submitted);
    println!("stale discards:    {}", s.stale_discards);
    println!("placeholders:      {}", s.placeholders);
    println!(
        "asset cache:       {} entries, {} bytes, hit rate {:.1}%",
        s.cache.entries,
        s.cache.bytes,
        s.cache.hit_rate() * 100.0
    );
    println!(
        "object pool:       {} reuses, {} cold creates",
        s.pool_reuses, s.pool_cold_creates
    );
    Ok(())
}

fn pack(input: &Path, output: &Path) -> anyhow::Result<()> {
    let mut files = Vec::new();
    collect_files(input, &mut files)
        .with_context(|| format!("scanning {}", input.display()))?;
    files.sort();
    anyhow::ensure!(!files.is_empty(), "no files found under {}", input.display());

    let mut builder = ArchiveBuilder::new();
    let mut total = 0usize;
    for file in &files {
        let rel = file
            .strip_prefix(input)
            .with_context(|| format!("file {} outside input root", file.display()))?;
        let data = std::fs::read(file).with_context(|| format!("reading {}", file.display()))?;
        total += data.len();
        builder.add(rel.to_string_lossy().replace('\\', "/"), data);
    }
    builder
        .write_to(output)
        .with_context(|| format!("writing {}", output.display()))?;
    println!(
        "packed {} files ({} bytes) into {}",
        files.len(),
        total,
        output.display()
    );
    Ok(())
}

fn collect_files(dir: &Path, out: &mut Vec<PathBuf>) -> std::io::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            collect_files(&path, out)?;
        } else {
            out.push(path);
        }
    }
    Ok(())
}

fn bake(output: &Path, extent: i32, prototypes: u64) -> anyhow::Result<()> {
    let store = BakedStore::open(output)
        .with_context(|| format!("opening baked store at {}", output.display()))?;

    let mut cells = 0u64;
    for x in -extent..=extent {
        for y in -extent..=extent {
            let cell = CellCoord::new(x, y);
            let salt = cell_salt(cell);
            store.bake_merged_mesh(&MergedMeshArtifact {
                cell,
                scene: SceneDescription {
                    name: format!("merged_{}_{}", cell.x, cell.y),
                    kind: NodeKind::Object,
                    vertex_count: 400 + (salt % 400) as u32,
                    index_count: 900 + (salt % 900) as u32,
                    approx_bytes: 64 * 1024,
                },
                source_placements: 1 + (salt % 40) as u32,
            })?;
            cells += 1;
        }
    }

    for id in 1..=prototypes {
        store.bake_impostor(&ImpostorArtifact {
            prototype_id: PrototypeId(id),
            width: 64,
            height: 128,
            rgba: vec![0; 64 * 128 * 4],
            world_height: 6.0 + id as f32,
        })?;
    }

    println!(
        "baked {cells} merged meshes and {prototypes} impostors into {}",
        output.display()
    );
    Ok(())
}
