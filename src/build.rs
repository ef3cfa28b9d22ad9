//! Graph builder adapter.
//!
//! Exports the assembled network as OSM XML (`network.osm`), compiles the
//! builtin routing graph (`routing-graph.json`), and optionally hands the
//! OSM file to an external routing-graph compiler. The compiler is a black
//! box: a non-zero exit fails the build with its output attached verbatim.

use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, Event};
use quick_xml::Writer;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::config::BuildConfig;
use crate::models::{Difficulty, Marking, NetworkEdge, NetworkGraph, Surface, WayType};

pub const NETWORK_FILE: &str = "network.osm";
pub const ROUTING_GRAPH_FILE: &str = "routing-graph.json";

/// Parallel edges whose lengths differ by less than this are alternates.
const EQUIVALENT_LENGTH_RATIO: f64 = 0.01;

#[derive(Debug)]
pub enum BuildError {
    Io(String),
    Compiler {
        command: String,
        status: Option<i32>,
        stdout: String,
        stderr: String,
    },
}

impl std::fmt::Display for BuildError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BuildError::Io(e) => write!(f, "artifact write failed: {}", e),
            BuildError::Compiler {
                command,
                status,
                stdout,
                stderr,
            } => {
                match status {
                    Some(code) => write!(f, "compiler '{}' exited with {}", command, code)?,
                    None => write!(f, "compiler '{}' did not complete", command)?,
                }
                if !stdout.is_empty() {
                    write!(f, "\n--- stdout ---\n{}", stdout)?;
                }
                if !stderr.is_empty() {
                    write!(f, "\n--- stderr ---\n{}", stderr)?;
                }
                Ok(())
            }
        }
    }
}

impl std::error::Error for BuildError {}

fn io_err(e: impl std::fmt::Display) -> BuildError {
    BuildError::Io(e.to_string())
}

/// A directory of built files ready for validation and publication.
#[derive(Debug, Clone)]
pub struct BuiltArtifact {
    pub dir: PathBuf,
    /// Paths relative to `dir`, sorted.
    pub files: Vec<String>,
    pub graph: CompiledGraph,
}

/// The builtin routing graph. Every undirected edge appears once per direction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompiledGraph {
    /// `[lon, lat]` per node id.
    pub nodes: Vec<[f64; 2]>,
    pub edges: Vec<CompiledEdge>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompiledEdge {
    pub from: usize,
    pub to: usize,
    pub segment_id: String,
    pub length_m: f64,
    pub duration_s: f64,
}

pub async fn build(
    graph: &NetworkGraph,
    out_dir: &Path,
    config: &BuildConfig,
) -> Result<BuiltArtifact, BuildError> {
    std::fs::create_dir_all(out_dir).map_err(io_err)?;

    let osm_path = out_dir.join(NETWORK_FILE);
    let xml = write_osm(graph)?;
    std::fs::write(&osm_path, xml).map_err(io_err)?;

    let compiled = compile(graph, config.walking_speed_kmh);
    let json = serde_json::to_vec_pretty(&compiled).map_err(io_err)?;
    std::fs::write(out_dir.join(ROUTING_GRAPH_FILE), json).map_err(io_err)?;
    tracing::info!(
        nodes = compiled.nodes.len(),
        edges = compiled.edges.len(),
        "routing graph compiled"
    );

    if let Some(command) = &config.compiler_command {
        run_compiler(command, &osm_path, out_dir).await?;
    }

    let mut files = Vec::new();
    for entry in walkdir::WalkDir::new(out_dir).sort_by_file_name() {
        let entry = entry.map_err(io_err)?;
        if !entry.file_type().is_file() {
            continue;
        }
        if let Ok(rel) = entry.path().strip_prefix(out_dir) {
            files.push(rel.to_string_lossy().replace('\\', "/"));
        }
    }
    files.sort();

    Ok(BuiltArtifact {
        dir: out_dir.to_path_buf(),
        files,
        graph: compiled,
    })
}

async fn run_compiler(command: &[String], input: &Path, output: &Path) -> Result<(), BuildError> {
    let expand = |arg: &String| {
        arg.replace("{input}", &input.to_string_lossy())
            .replace("{output}", &output.to_string_lossy())
    };
    let args: Vec<String> = command.iter().map(expand).collect();
    let cmdline = args.join(" ");
    let Some((program, rest)) = args.split_first() else {
        return Err(BuildError::Io("empty compiler command".to_string()));
    };

    tracing::info!(command = %cmdline, "running external compiler");
    let out = tokio::process::Command::new(program)
        .args(rest)
        .current_dir(output)
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| BuildError::Compiler {
            command: cmdline.clone(),
            status: None,
            stdout: String::new(),
            stderr: e.to_string(),
        })?;

    if !out.status.success() {
        return Err(BuildError::Compiler {
            command: cmdline,
            status: out.status.code(),
            stdout: String::from_utf8_lossy(&out.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&out.stderr).into_owned(),
        });
    }
    Ok(())
}

/// Builtin compilation: drop self-loops, collapse equivalent parallel edges
/// to their highest-confidence alternate, and emit both directions.
pub fn compile(graph: &NetworkGraph, walking_speed_kmh: f64) -> CompiledGraph {
    let speed_ms = walking_speed_kmh / 3.6;

    let mut groups: BTreeMap<(usize, usize), Vec<&NetworkEdge>> = BTreeMap::new();
    for e in &graph.edges {
        if e.from_node == e.to_node {
            continue;
        }
        let key = (e.from_node.min(e.to_node), e.from_node.max(e.to_node));
        groups.entry(key).or_default().push(e);
    }

    let mut edges = Vec::new();
    for mut group in groups.into_values() {
        group.sort_by(|a, b| {
            b.edge
                .confidence
                .partial_cmp(&a.edge.confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.edge.segment_id.cmp(&b.edge.segment_id))
        });
        let mut kept: Vec<&NetworkEdge> = Vec::new();
        for e in group {
            let equivalent = kept.iter().any(|k| {
                (k.length_m - e.length_m).abs() <= EQUIVALENT_LENGTH_RATIO * k.length_m.max(e.length_m)
            });
            if equivalent {
                tracing::debug!(segment = %e.edge.segment_id, "dropping equivalent alternate");
                continue;
            }
            kept.push(e);
        }
        for e in kept {
            let duration_s = e.length_m / speed_ms;
            for (from, to) in [(e.from_node, e.to_node), (e.to_node, e.from_node)] {
                edges.push(CompiledEdge {
                    from,
                    to,
                    segment_id: e.edge.segment_id.clone(),
                    length_m: e.length_m,
                    duration_s,
                });
            }
        }
    }

    CompiledGraph {
        nodes: graph.nodes.iter().map(|n| [n.coord.0, n.coord.1]).collect(),
        edges,
    }
}

/// OSM XML 0.6. Junction nodes keep their network ids (offset by one);
/// interior vertices are numbered after them.
pub fn write_osm(graph: &NetworkGraph) -> Result<Vec<u8>, BuildError> {
    let mut w = Writer::new_with_indent(Vec::new(), b' ', 2);
    w.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))
        .map_err(io_err)?;
    w.write_event(Event::Start(
        BytesStart::new("osm").with_attributes([("version", "0.6"), ("generator", "trailforge")]),
    ))
    .map_err(io_err)?;

    for node in &graph.nodes {
        write_node(&mut w, node.id as u64 + 1, node.coord)?;
    }

    let mut next_id = graph.nodes.len() as u64 + 1;
    let mut ways = Vec::with_capacity(graph.edges.len());
    for e in &graph.edges {
        let mut refs = vec![e.from_node as u64 + 1];
        let interior = e.coords.len().saturating_sub(2);
        for &c in e.coords.iter().skip(1).take(interior) {
            write_node(&mut w, next_id, c)?;
            refs.push(next_id);
            next_id += 1;
        }
        refs.push(e.to_node as u64 + 1);
        ways.push(refs);
    }

    for (i, (e, refs)) in graph.edges.iter().zip(ways).enumerate() {
        let id = (i + 1).to_string();
        w.write_event(Event::Start(
            BytesStart::new("way").with_attributes([("id", id.as_str()), ("version", "1")]),
        ))
        .map_err(io_err)?;
        for r in refs {
            let r = r.to_string();
            w.write_event(Event::Empty(
                BytesStart::new("nd").with_attributes([("ref", r.as_str())]),
            ))
            .map_err(io_err)?;
        }
        for (k, v) in way_tags(e) {
            w.write_event(Event::Empty(
                BytesStart::new("tag").with_attributes([("k", k), ("v", v.as_str())]),
            ))
            .map_err(io_err)?;
        }
        w.write_event(Event::End(BytesEnd::new("way")))
            .map_err(io_err)?;
    }

    w.write_event(Event::End(BytesEnd::new("osm")))
        .map_err(io_err)?;
    Ok(w.into_inner())
}

fn write_node(w: &mut Writer<Vec<u8>>, id: u64, c: (f64, f64)) -> Result<(), BuildError> {
    let id = id.to_string();
    let lat = format!("{:.7}", c.1);
    let lon = format!("{:.7}", c.0);
    w.write_event(Event::Empty(BytesStart::new("node").with_attributes([
        ("id", id.as_str()),
        ("version", "1"),
        ("lat", lat.as_str()),
        ("lon", lon.as_str()),
    ])))
    .map_err(io_err)
}

fn way_tags(e: &NetworkEdge) -> Vec<(&'static str, String)> {
    let edge = &e.edge;
    let mut tags = vec![
        ("highway", highway(edge.way).to_string()),
        ("trailforge:segment_id", edge.segment_id.clone()),
        ("trailforge:activity", enum_tag(&edge.activity)),
        ("trailforge:confidence", format!("{:.3}", edge.confidence)),
    ];
    if let Some(name) = &edge.name {
        tags.push(("name", name.clone()));
    }
    if let Some(reference) = &edge.reference {
        tags.push(("ref", reference.clone()));
    }
    if let Some(follows) = &edge.follows {
        tags.push(("trailforge:follows", follows.clone()));
    }
    if edge.difficulty.value != Difficulty::Unspecified {
        tags.push(("trailforge:difficulty", enum_tag(&edge.difficulty.value)));
        if edge.difficulty.is_inferred() {
            tags.push(("source:trailforge:difficulty", "inferred".to_string()));
        }
    }
    if let Some(surface) = surface_tag(edge.surface.value) {
        tags.push(("surface", surface.to_string()));
        if edge.surface.is_inferred() {
            tags.push(("source:surface", "inferred".to_string()));
        }
    }
    if edge.marking != Marking::Unspecified {
        tags.push(("trailforge:marking", enum_tag(&edge.marking)));
    }
    let c = &edge.conditional;
    if let Some(season) = &c.season {
        tags.push(("trailforge:season", enum_tag(season)));
    }
    if let Some(lit) = c.lit {
        tags.push(("lit", yes_no(lit)));
    }
    if let Some(signposted) = c.signposted {
        tags.push(("trailforge:signposted", yes_no(signposted)));
    }
    if let Some(width) = &c.width_class {
        tags.push(("trailforge:width_class", width.clone()));
    }
    if let Some(traffic) = &c.traffic_class {
        tags.push(("trailforge:traffic", traffic.clone()));
    }
    if let Some(maintainer) = &edge.maintainer {
        tags.push(("operator", maintainer.clone()));
    }
    tags
}

fn highway(way: WayType) -> &'static str {
    match way {
        WayType::Road => "unclassified",
        WayType::Track => "track",
        WayType::Footway => "footway",
        WayType::Cycleway => "cycleway",
        WayType::Path | WayType::Terrain | WayType::Waterway | WayType::Unspecified => "path",
    }
}

fn surface_tag(surface: Surface) -> Option<&'static str> {
    match surface {
        Surface::Paved => Some("paved"),
        Surface::Gravel => Some("gravel"),
        Surface::Natural => Some("ground"),
        Surface::Other => Some("unknown"),
        Surface::Unspecified => None,
    }
}

fn yes_no(b: bool) -> String {
    match b {
        true => "yes".to_string(),
        false => "no".to_string(),
    }
}

/// The serde snake_case name of a unit enum variant.
fn enum_tag<T: Serialize>(value: &T) -> String {
    match serde_json::to_value(value) {
        Ok(serde_json::Value::String(s)) => s,
        _ => "unspecified".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assemble::{assemble, MappedSegment};
    use crate::codes::CodeTable;
    use crate::config::AssemblyConfig;
    use crate::mapping::Mapper;
    use crate::models::TrailSegment;
    use chrono::Utc;
    use tempfile::TempDir;

    fn network(segments: &[(&str, &[(&str, &str)], Vec<(f64, f64)>)]) -> NetworkGraph {
        let mapper = Mapper::new(CodeTable::geonorge().unwrap(), Utc::now());
        let mapped = segments
            .iter()
            .map(|(id, attrs, coords)| {
                let segment = TrailSegment {
                    segment_id: id.to_string(),
                    coords: coords.clone(),
                    attributes: attrs
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect(),
                };
                MappedSegment {
                    edge: mapper.map(&segment),
                    segment,
                }
            })
            .collect();
        assemble(mapped, "rutenummer", &AssemblyConfig::default()).unwrap()
    }

    #[test]
    fn osm_export_has_nodes_ways_and_tags() {
        let graph = network(&[(
            "s1",
            &[("rutefolger", "ST"), ("rutenavn", "Fjellstien")],
            vec![(10.0, 60.0), (10.005, 60.001), (10.01, 60.0)],
        )]);
        let xml = String::from_utf8(write_osm(&graph).unwrap()).unwrap();
        assert!(xml.starts_with("<?xml"));
        assert_eq!(xml.matches("<node ").count(), 3);
        assert_eq!(xml.matches("<way ").count(), 1);
        assert!(xml.contains(r#"k="highway" v="path""#));
        assert!(xml.contains(r#"k="name" v="Fjellstien""#));
        assert!(xml.contains(r#"k="source:trailforge:difficulty" v="inferred""#));
    }

    #[test]
    fn compile_emits_both_directions() {
        let graph = network(&[("s1", &[], vec![(10.0, 60.0), (10.01, 60.0)])]);
        let compiled = compile(&graph, 3.6);
        assert_eq!(compiled.nodes.len(), 2);
        assert_eq!(compiled.edges.len(), 2);
        assert_eq!(compiled.edges[0].from, compiled.edges[1].to);
        // 1 m/s
        assert!((compiled.edges[0].duration_s - compiled.edges[0].length_m).abs() < 1e-9);
    }

    #[test]
    fn equivalent_parallel_edges_keep_higher_confidence() {
        let graph = network(&[
            (
                "good",
                &[("vedlikeholdsansvarlig", "DNT"), ("noyaktighet", "1")],
                vec![(10.0, 60.0), (10.01, 60.0)],
            ),
            ("poor", &[], vec![(10.0, 60.0), (10.005, 60.000_01), (10.01, 60.0)]),
        ]);
        let compiled = compile(&graph, 4.5);
        assert_eq!(compiled.edges.len(), 2);
        assert!(compiled.edges.iter().all(|e| e.segment_id == "good"));
    }

    #[test]
    fn distinct_parallel_edges_both_kept() {
        let graph = network(&[
            ("short", &[], vec![(10.0, 60.0), (10.01, 60.0)]),
            ("detour", &[], vec![(10.0, 60.0), (10.005, 60.01), (10.01, 60.0)]),
        ]);
        assert_eq!(compile(&graph, 4.5).edges.len(), 4);
    }

    #[tokio::test]
    async fn build_writes_artifact_files() {
        let dir = TempDir::new().unwrap();
        let graph = network(&[("s1", &[], vec![(10.0, 60.0), (10.01, 60.0)])]);
        let artifact = build(&graph, dir.path(), &BuildConfig::default())
            .await
            .unwrap();
        assert_eq!(
            artifact.files,
            vec![NETWORK_FILE.to_string(), ROUTING_GRAPH_FILE.to_string()]
        );
        let stored: CompiledGraph =
            serde_json::from_slice(&std::fs::read(dir.path().join(ROUTING_GRAPH_FILE)).unwrap())
                .unwrap();
        assert_eq!(stored, artifact.graph);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failing_compiler_reports_output_verbatim() {
        let dir = TempDir::new().unwrap();
        let graph = network(&[("s1", &[], vec![(10.0, 60.0), (10.01, 60.0)])]);
        let config = BuildConfig {
            compiler_command: Some(vec![
                "sh".to_string(),
                "-c".to_string(),
                "echo parsing {input}; echo 'bad way' >&2; exit 2".to_string(),
            ]),
            ..BuildConfig::default()
        };
        let err = build(&graph, dir.path(), &config).await.unwrap_err();
        match err {
            BuildError::Compiler {
                status,
                stdout,
                stderr,
                ..
            } => {
                assert_eq!(status, Some(2));
                assert!(stdout.contains("network.osm"));
                assert_eq!(stderr, "bad way\n");
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn compiler_output_is_collected() {
        let dir = TempDir::new().unwrap();
        let graph = network(&[("s1", &[], vec![(10.0, 60.0), (10.01, 60.0)])]);
        let config = BuildConfig {
            compiler_command: Some(vec![
                "sh".to_string(),
                "-c".to_string(),
                "cp {input} {output}/network.osrm".to_string(),
            ]),
            ..BuildConfig::default()
        };
        let artifact = build(&graph, dir.path(), &config).await.unwrap();
        assert!(artifact.files.contains(&"network.osrm".to_string()));
    }
}
