//! # Trailforge
//!
//! A quality-gated release pipeline that turns the Norwegian national trail
//! dataset (Geonorge "Tur- og friluftsruter") into a versioned, routable
//! trail network.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌────────┐   ┌─────────┐   ┌──────────┐   ┌───────┐   ┌─────────┐   ┌─────────┐
//! │  Fetch   │──▶│ Change │──▶│ Decode  │──▶│ Assemble │──▶│ Build │──▶│ Quality │──▶│ Release │
//! │ + retry  │   │ detect │   │ + map   │   │ topology │   │  OSM  │   │ checks  │   │  store  │
//! └──────────┘   └────────┘   └─────────┘   └──────────┘   └───────┘   └─────────┘   └────┬────┘
//!                                                                                          │
//!                                  ┌──────────────┬────────────────────────────────────────┤
//!                                  ▼              ▼                                        ▼
//!                             ┌─────────┐   ┌──────────┐                            ┌─────────────┐
//!                             │ Ledger  │   │  Notify  │                            │ latest.json │
//!                             │ SQLite  │   │ webhook  │                            └─────────────┘
//!                             └─────────┘   └──────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! trailforge init                 # create store and ledger
//! trailforge check                # is a new snapshot available? (exit 0 = yes, 3 = no)
//! trailforge run                  # fetch, build, validate and publish
//! trailforge releases             # list published releases
//! trailforge inspect              # show the current release
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`source`] | Snapshot sources (Geonorge ATOM feed, local directory) |
//! | [`fetch`] | Retrying fetcher with checksum validation |
//! | [`change`] | Change detection |
//! | [`decode`] | GeoJSON / ZIP snapshot decoding |
//! | [`codes`] | Per-source code tables |
//! | [`mapping`] | Attribute mapping and inference |
//! | [`geometry`] | Distances, bounding boxes, line repair |
//! | [`assemble`] | Network assembly |
//! | [`build`] | OSM export and routing graph compilation |
//! | [`routing`] | Shortest paths over the compiled graph |
//! | [`quality`] | Quality checks |
//! | [`release`] | Versioned release store |
//! | [`ledger`] | Run history and failure issues |
//! | [`notify`] | Run notifications |
//! | [`lock`] | Store-wide run lock |
//! | [`pipeline`] | Run orchestration |

pub mod assemble;
pub mod build;
pub mod change;
pub mod codes;
pub mod config;
pub mod db;
pub mod decode;
pub mod fetch;
pub mod geometry;
pub mod inspect;
pub mod ledger;
pub mod lock;
pub mod logging;
pub mod mapping;
pub mod migrate;
pub mod models;
pub mod notify;
pub mod pipeline;
pub mod progress;
pub mod quality;
pub mod release;
pub mod routing;
pub mod source;
