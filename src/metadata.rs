//! Site registration fragments: a GeoJSON feature, a CIME grid alias and
//! CDEPS stream entries, checked against the recipe and package they describe.

use std::fs;
use std::io::Cursor;
use std::path::Path;

use quick_xml::Writer;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use serde::{Deserialize, Serialize};

use crate::domain::{Coordinate, SiteId, StreamGroup, TimeInterpolation, VersionTag};
use crate::error::SitepackError;
use crate::forcing::ForcingStream;
use crate::package::{ArtifactKind, Manifest};
use crate::recipe::SiteRecipe;

pub const COORDINATE_TOLERANCE: f64 = 1e-9;
pub const FRAGMENT_FILE: &str = "fragment.json";
const DATA_ROOT: &str = "$DIN_LOC_ROOT";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeoFeature {
    #[serde(rename = "type")]
    pub kind: String,
    pub geometry: PointGeometry,
    pub properties: FeatureProperties,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PointGeometry {
    #[serde(rename = "type")]
    pub kind: String,
    /// GeoJSON order: longitude, latitude.
    pub coordinates: [f64; 2],
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureProperties {
    pub site_id: SiteId,
    pub name: String,
    #[serde(default)]
    pub group: Option<String>,
    #[serde(default)]
    pub elevation: Option<f64>,
    pub version: VersionTag,
    pub grid: String,
    pub download: String,
    pub surface_file: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridAlias {
    pub alias: String,
    pub domain_file: String,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamEntry {
    pub name: String,
    pub group: StreamGroup,
    pub file: String,
    pub variables: Vec<(String, String)>,
    pub tintalgo: TimeInterpolation,
    pub offset: i64,
    pub year_first: i32,
    pub year_last: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SiteMetadataFragment {
    pub site_id: SiteId,
    pub version: VersionTag,
    pub coordinate: Coordinate,
    pub archive: String,
    pub feature: GeoFeature,
    pub grid_alias: GridAlias,
    pub streams: Vec<StreamEntry>,
}

pub fn build_fragment(
    recipe: &SiteRecipe,
    manifest: &Manifest,
    streams: &[ForcingStream],
    base_url: Option<&str>,
) -> Result<SiteMetadataFragment, SitepackError> {
    let artifact_path = |kind: ArtifactKind| {
        manifest
            .entry(kind)
            .map(|entry| entry.path.clone())
            .ok_or_else(|| {
                SitepackError::InconsistentMetadata(format!(
                    "manifest for {} has no {kind:?} artifact",
                    manifest.site_id
                ))
            })
    };
    let domain_file = artifact_path(ArtifactKind::Domain)?;
    let surface_file = artifact_path(ArtifactKind::Surface)?;
    let download = match base_url {
        Some(base) => format!("{base}/{}", manifest.archive),
        None => manifest.archive.clone(),
    };
    let grid = recipe.site_id.grid_name();

    Ok(SiteMetadataFragment {
        site_id: recipe.site_id.clone(),
        version: recipe.version.clone(),
        coordinate: recipe.coordinate,
        archive: manifest.archive.clone(),
        feature: GeoFeature {
            kind: "Feature".to_string(),
            geometry: PointGeometry {
                kind: "Point".to_string(),
                coordinates: [recipe.coordinate.lon, recipe.coordinate.lat],
            },
            properties: FeatureProperties {
                site_id: recipe.site_id.clone(),
                name: recipe.name.clone(),
                group: recipe.group.clone(),
                elevation: recipe.elevation,
                version: recipe.version.clone(),
                grid: grid.clone(),
                download,
                surface_file,
            },
        },
        grid_alias: GridAlias {
            alias: grid,
            domain_file,
            description: format!("{} {} single-point domain", recipe.name, recipe.coordinate),
        },
        streams: streams
            .iter()
            .map(|stream| StreamEntry {
                name: format!("CLM1PT.{}.{}", recipe.site_id, stream.group),
                group: stream.group,
                file: stream.relative_path.clone(),
                variables: stream.variables.clone(),
                tintalgo: stream.interpolation,
                offset: stream.offset_seconds,
                year_first: stream.start_year,
                year_last: stream.end_year,
            })
            .collect(),
    })
}

/// Rejects a fragment that disagrees with its recipe or, when given, with
/// the package manifest.
pub fn validate(
    fragment: &SiteMetadataFragment,
    recipe: &SiteRecipe,
    manifest: Option<&Manifest>,
) -> Result<(), SitepackError> {
    let fail = |message: String| Err(SitepackError::InconsistentMetadata(message));

    if fragment.site_id != recipe.site_id {
        return fail(format!(
            "fragment site id {} does not match recipe site id {}",
            fragment.site_id, recipe.site_id
        ));
    }
    if !fragment
        .coordinate
        .approx_eq(&recipe.coordinate, COORDINATE_TOLERANCE)
    {
        return fail(format!(
            "fragment coordinate {} does not match recipe coordinate {}",
            fragment.coordinate, recipe.coordinate
        ));
    }
    let properties = &fragment.feature.properties;
    if properties.site_id != fragment.site_id {
        return fail(format!(
            "feature site id {} does not match {}",
            properties.site_id, fragment.site_id
        ));
    }
    let [lon, lat] = fragment.feature.geometry.coordinates;
    if !Coordinate::new(lat, lon).approx_eq(&recipe.coordinate, COORDINATE_TOLERANCE) {
        return fail(format!(
            "feature point ({lat}, {lon}) does not match recipe coordinate {}",
            recipe.coordinate
        ));
    }
    if fragment.grid_alias.alias != recipe.site_id.grid_name() {
        return fail(format!(
            "grid alias {} does not belong to site {}",
            fragment.grid_alias.alias, recipe.site_id
        ));
    }
    for group in StreamGroup::ALL {
        let matching: Vec<&StreamEntry> = fragment
            .streams
            .iter()
            .filter(|entry| entry.group == group)
            .collect();
        let [entry] = matching.as_slice() else {
            return fail(format!(
                "expected one {group} stream entry, found {}",
                matching.len()
            ));
        };
        if entry.tintalgo != group.interpolation() || entry.offset != group.offset_seconds() {
            return fail(format!(
                "{group} stream declares {}/{} but was assembled with {}/{}",
                entry.tintalgo,
                entry.offset,
                group.interpolation(),
                group.offset_seconds()
            ));
        }
    }

    if let Some(manifest) = manifest {
        if manifest.site_id != fragment.site_id {
            return fail(format!(
                "package site id {} does not match fragment site id {}",
                manifest.site_id, fragment.site_id
            ));
        }
        if manifest.version != fragment.version || manifest.archive != fragment.archive {
            return fail(format!(
                "fragment refers to {} but the package is {}",
                fragment.archive, manifest.archive
            ));
        }
        let packaged = |path: &str| manifest.artifacts.iter().any(|entry| entry.path == path);
        let referenced = fragment
            .streams
            .iter()
            .map(|entry| entry.file.as_str())
            .chain([
                fragment.grid_alias.domain_file.as_str(),
                properties.surface_file.as_str(),
            ]);
        for path in referenced {
            if !packaged(path) {
                return fail(format!("{path} is referenced but not packaged"));
            }
        }
    }
    Ok(())
}

pub fn load_fragment(path: &Path) -> Result<SiteMetadataFragment, SitepackError> {
    let content = fs::read_to_string(path)
        .map_err(|err| SitepackError::Filesystem(format!("read {}: {err}", path.display())))?;
    serde_json::from_str(&content).map_err(|err| {
        SitepackError::InconsistentMetadata(format!("{}: {err}", path.display()))
    })
}

/// Writes `site.geojson`, `grid_alias.xml`, `datm_streams.xml` and
/// `fragment.json` into `dir`.
pub fn write_fragment(fragment: &SiteMetadataFragment, dir: &Path) -> Result<(), SitepackError> {
    fs::create_dir_all(dir).map_err(|err| SitepackError::Filesystem(err.to_string()))?;
    let write = |name: &str, content: Vec<u8>| {
        fs::write(dir.join(name), content)
            .map_err(|err| SitepackError::Filesystem(format!("write {name}: {err}")))
    };
    write("site.geojson", to_json(&fragment.feature)?)?;
    write("grid_alias.xml", grid_alias_xml(fragment)?)?;
    write("datm_streams.xml", streams_xml(fragment)?)?;
    write(FRAGMENT_FILE, to_json(fragment)?)?;
    Ok(())
}

fn to_json<T: Serialize>(value: &T) -> Result<Vec<u8>, SitepackError> {
    let mut bytes = serde_json::to_vec_pretty(value)
        .map_err(|err| SitepackError::Filesystem(err.to_string()))?;
    bytes.push(b'\n');
    Ok(bytes)
}

type XmlWriter = Writer<Cursor<Vec<u8>>>;

fn xml_error(err: impl std::fmt::Display) -> SitepackError {
    SitepackError::Filesystem(format!("xml: {err}"))
}

fn new_document() -> Result<XmlWriter, SitepackError> {
    let mut writer = Writer::new_with_indent(Cursor::new(Vec::new()), b' ', 2);
    writer
        .write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))
        .map_err(xml_error)?;
    Ok(writer)
}

fn open(writer: &mut XmlWriter, name: &str, attributes: &[(&str, &str)]) -> Result<(), SitepackError> {
    let mut start = BytesStart::new(name);
    for attribute in attributes {
        start.push_attribute(*attribute);
    }
    writer.write_event(Event::Start(start)).map_err(xml_error)
}

fn close(writer: &mut XmlWriter, name: &str) -> Result<(), SitepackError> {
    writer
        .write_event(Event::End(BytesEnd::new(name)))
        .map_err(xml_error)
}

fn element(
    writer: &mut XmlWriter,
    name: &str,
    attributes: &[(&str, &str)],
    text: &str,
) -> Result<(), SitepackError> {
    open(writer, name, attributes)?;
    writer
        .write_event(Event::Text(BytesText::new(text)))
        .map_err(xml_error)?;
    close(writer, name)
}

fn finish(writer: XmlWriter) -> Vec<u8> {
    let mut bytes = writer.into_inner().into_inner();
    bytes.push(b'\n');
    bytes
}

pub fn grid_alias_xml(fragment: &SiteMetadataFragment) -> Result<Vec<u8>, SitepackError> {
    let alias = fragment.grid_alias.alias.as_str();
    let mut writer = new_document()?;
    open(&mut writer, "grids", &[])?;
    open(&mut writer, "model_grid", &[("alias", alias)])?;
    element(&mut writer, "grid", &[("name", "atm")], alias)?;
    element(&mut writer, "grid", &[("name", "lnd")], alias)?;
    close(&mut writer, "model_grid")?;
    open(&mut writer, "domain", &[("name", alias)])?;
    element(&mut writer, "nx", &[], "1")?;
    element(&mut writer, "ny", &[], "1")?;
    element(
        &mut writer,
        "file",
        &[],
        &format!("{DATA_ROOT}/{}", fragment.grid_alias.domain_file),
    )?;
    element(&mut writer, "desc", &[], &fragment.grid_alias.description)?;
    close(&mut writer, "domain")?;
    close(&mut writer, "grids")?;
    Ok(finish(writer))
}

pub fn streams_xml(fragment: &SiteMetadataFragment) -> Result<Vec<u8>, SitepackError> {
    let mut writer = new_document()?;
    open(&mut writer, "stream_data", &[])?;
    for entry in &fragment.streams {
        open(&mut writer, "stream_entry", &[("name", entry.name.as_str())])?;
        open(&mut writer, "stream_datafiles", &[])?;
        element(&mut writer, "file", &[], &format!("{DATA_ROOT}/{}", entry.file))?;
        close(&mut writer, "stream_datafiles")?;
        open(&mut writer, "stream_datavars", &[])?;
        for (file_var, model_var) in &entry.variables {
            element(&mut writer, "var", &[], &format!("{file_var} {model_var}"))?;
        }
        close(&mut writer, "stream_datavars")?;
        element(&mut writer, "stream_mapalgo", &[], "none")?;
        element(&mut writer, "stream_tintalgo", &[], &entry.tintalgo.to_string())?;
        element(&mut writer, "stream_taxmode", &[], "cycle")?;
        element(&mut writer, "stream_offset", &[], &entry.offset.to_string())?;
        element(&mut writer, "year_first", &[], &entry.year_first.to_string())?;
        element(&mut writer, "year_last", &[], &entry.year_last.to_string())?;
        element(&mut writer, "year_align", &[], &entry.year_first.to_string())?;
        close(&mut writer, "stream_entry")?;
    }
    close(&mut writer, "stream_data")?;
    Ok(finish(writer))
}
