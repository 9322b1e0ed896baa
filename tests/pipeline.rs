#![cfg(unix)]

mod common;

use std::collections::BTreeMap;
use std::fs;
use std::io::Read;
use std::path::Path;

use assert_matches::assert_matches;
use flate2::Compression;
use flate2::write::GzEncoder;

use lsp_sitepack::domain::{DatasetCategory, StreamGroup};
use lsp_sitepack::error::{SitepackError, ToolFailureKind};
use lsp_sitepack::fs_util::sha256_bytes;
use lsp_sitepack::grid::{GridDescriptor, GridLayout};
use lsp_sitepack::package::{ArtifactKind, Manifest};
use lsp_sitepack::pipeline::{SilentSink, TOPOGRAPHY_VARIABLE};
use lsp_sitepack::recipe::RecipeLoader;

use common::{
    FakeToolkit, Workspace, machine_with, month_values, pipeline, pipeline_with, regular_grid, write_grid,
};

fn archive_entries(path: &Path) -> BTreeMap<String, Vec<u8>> {
    let mut archive = tar::Archive::new(fs::File::open(path).unwrap());
    let mut entries = BTreeMap::new();
    for entry in archive.entries().unwrap() {
        let mut entry = entry.unwrap();
        let name = entry.path().unwrap().to_string_lossy().to_string();
        let mut content = Vec::new();
        entry.read_to_end(&mut content).unwrap();
        entries.insert(name, content);
    }
    entries
}

fn prepared(years: (i32, i32)) -> (Workspace, std::path::PathBuf) {
    let ws = Workspace::new();
    ws.write_forcing(years.0, years.1);
    ws.write_surface();
    let recipe = ws.write_recipe("fns.yaml", "FNS", 60.1, 11.1, years);
    (ws, recipe)
}

fn manifest_paths(manifest: &Manifest) -> Vec<&str> {
    manifest.artifacts.iter().map(|entry| entry.path.as_str()).collect()
}

const ANCILLARIES: [(&str, &str); 6] = [
    ("fire", "abm.nc"),
    ("population", "popdens.nc"),
    ("urban", "urban_properties.nc"),
    ("lightning", "lnfm.nc"),
    ("aerosol_deposition", "aerodep.nc"),
    ("topography", "topo.nc"),
];

/// A complete-profile recipe with every ancillary category present.
fn prepared_complete() -> (Workspace, std::path::PathBuf) {
    let ws = Workspace::new();
    ws.write_forcing(1991, 1991);
    ws.write_surface();
    let mut extra = String::new();
    for (category, file_name) in ANCILLARIES {
        let path = ws.write_ancillary(file_name);
        extra.push_str(&format!("  {category}:\n    path: {}\n", path.display()));
    }
    extra.push_str("profile: complete\n");
    let recipe = ws.write_recipe_with("fns.yaml", "FNS", 60.1, 11.1, (1991, 1991), &extra);
    (ws, recipe)
}

#[test]
fn builds_forcing_package_and_fragment() {
    let (ws, recipe_path) = prepared((1991, 1992));
    let recipe = RecipeLoader::load(&recipe_path).unwrap();
    let toolkit = FakeToolkit::default();
    let annotations = toolkit.annotations.clone();
    let fills = toolkit.fills.clone();
    let pipeline = pipeline_with(ws.machine(), ws.root(), toolkit).with_output(Some(ws.output_dir()));

    let outcome = pipeline.run(&recipe, &SilentSink).unwrap();
    assert!(fills.borrow().is_empty());

    assert_eq!(
        outcome.archive,
        ws.output_dir().join("inputdata/inputdata_version1.0.0_FNS.tar")
    );
    let manifest = &outcome.manifest;
    assert_eq!(manifest.artifacts.len(), 5);
    assert_eq!(manifest.generated_at, "2024-05-01T12:00:00Z");
    let paths: Vec<&str> = manifest.artifacts.iter().map(|entry| entry.path.as_str()).collect();
    assert_eq!(
        paths,
        vec![
            "atm/datm7/CLM1PT_data/1x1_FNS/FNS.Precip.1991-1992.nc",
            "atm/datm7/CLM1PT_data/1x1_FNS/FNS.Solar.1991-1992.nc",
            "atm/datm7/CLM1PT_data/1x1_FNS/FNS.TPQW.1991-1992.nc",
            "lnd/clm2/surfdata_map/1x1_FNS/surfdata_1x1_FNS.nc",
            "share/domains/1x1_FNS/domain.lnd.1x1_FNS.nc",
        ]
    );

    let entries = archive_entries(&outcome.archive);
    assert_eq!(entries.len(), 6);
    let packaged: Manifest =
        serde_json::from_slice(&entries["inputdata/manifest_FNS.json"]).unwrap();
    assert_eq!(&packaged, manifest);
    for entry in &manifest.artifacts {
        let content = &entries[&format!("inputdata/{}", entry.path)];
        assert_eq!(sha256_bytes(content), entry.sha256, "{}", entry.path);
        assert_eq!(content.len() as u64, entry.bytes);
    }
    assert_eq!(
        entries["inputdata/share/domains/1x1_FNS/domain.lnd.1x1_FNS.nc"],
        b"domain\n"
    );

    let tpqw: GridDescriptor = serde_json::from_slice(
        &entries["inputdata/atm/datm7/CLM1PT_data/1x1_FNS/FNS.TPQW.1991-1992.nc"],
    )
    .unwrap();
    let time = tpqw.time.as_ref().unwrap();
    assert_eq!(time.values.len(), 48);
    assert!(time.is_strictly_increasing());
    assert_eq!(tpqw.origin().unwrap().lat, 60.25);

    let annotations = annotations.borrow();
    assert_eq!(annotations.len(), 3);
    let (_, attributes) = &annotations[0];
    assert!(attributes.contains(&("site_id".to_string(), "FNS".to_string())));
    assert!(attributes.contains(&("tintalgo".to_string(), "coszen".to_string())));
    assert!(attributes.contains(&("selected_cell".to_string(), "60.25,11.25".to_string())));

    let metadata_dir = ws.output_dir().join("site_metadata/FNS");
    for name in ["site.geojson", "grid_alias.xml", "datm_streams.xml", "fragment.json"] {
        assert!(metadata_dir.join(name).is_file(), "{name}");
    }
    assert_eq!(outcome.fragment.streams.len(), StreamGroup::ALL.len());
    assert_eq!(
        outcome.fragment.feature.properties.download,
        "https://data.example.org/sites/inputdata_version1.0.0_FNS.tar"
    );

    let mut leftovers: Vec<String> = fs::read_dir(ws.output_dir())
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().to_string())
        .collect();
    leftovers.sort();
    assert_eq!(leftovers, vec!["inputdata", "site_metadata"]);
}

#[test]
fn repeated_runs_are_byte_identical() {
    let (ws, recipe_path) = prepared((1991, 1991));
    let recipe = RecipeLoader::load(&recipe_path).unwrap();
    let pipeline = pipeline(ws.machine(), ws.root()).with_output(Some(ws.output_dir()));

    let first = pipeline.run(&recipe, &SilentSink).unwrap();
    let archive = fs::read(&first.archive).unwrap();
    let fragment = fs::read(first.metadata_dir.join("fragment.json")).unwrap();

    let second = pipeline.run(&recipe, &SilentSink).unwrap();
    assert_eq!(fs::read(&second.archive).unwrap(), archive);
    assert_eq!(fs::read(second.metadata_dir.join("fragment.json")).unwrap(), fragment);
}

#[test]
fn coordinate_outside_grid_writes_nothing() {
    let ws = Workspace::new();
    ws.write_forcing(1991, 1991);
    ws.write_surface();
    let recipe_path = ws.write_recipe("far.yaml", "FAR", 45.0, 11.1, (1991, 1991));
    let recipe = RecipeLoader::load(&recipe_path).unwrap();
    let pipeline = pipeline(ws.machine(), ws.root()).with_output(Some(ws.output_dir()));

    let err = pipeline.run(&recipe, &SilentSink).unwrap_err();
    assert_matches!(
        err,
        SitepackError::CoordinateOutOfDomain { ref category, lat, .. } if category == "surface" && lat == 45.0
    );
    assert_eq!(err.exit_code(), 2);
    assert!(!ws.output_dir().exists());
}

#[test]
fn missing_month_is_reported_before_any_work() {
    let (ws, recipe_path) = prepared((1991, 1992));
    fs::remove_file(ws.forcing_file("Precip", 1992, 7)).unwrap();
    let recipe = RecipeLoader::load(&recipe_path).unwrap();
    let pipeline = pipeline(ws.machine(), ws.root()).with_output(Some(ws.output_dir()));

    let err = pipeline.run(&recipe, &SilentSink).unwrap_err();
    assert_matches!(
        err,
        SitepackError::TemporalCoverage { ref group, year: 1992, ref detail }
            if group == "Precip" && detail.contains("07")
    );
    assert!(!ws.output_dir().exists());
}

#[test]
fn non_monotonic_time_axis_leaves_no_partial_output() {
    let (ws, recipe_path) = prepared((1991, 1991));
    write_grid(
        &ws.forcing_file("TPQW", 1991, 3),
        // both records in March, but the second precedes the first
        &regular_grid(Some(vec![69.0, 60.0])),
    );
    let recipe = RecipeLoader::load(&recipe_path).unwrap();
    let pipeline = pipeline(ws.machine(), ws.root()).with_output(Some(ws.output_dir()));

    let err = pipeline.run(&recipe, &SilentSink).unwrap_err();
    assert_matches!(err, SitepackError::TemporalCoverage { ref group, .. } if group == "TPQW");
    let leftovers = fs::read_dir(ws.output_dir()).unwrap().count();
    assert_eq!(leftovers, 0);
}

#[test]
fn failing_surface_generator_aborts_site() {
    let (ws, recipe_path) = prepared((1991, 1991));
    let domain = ws.write_generator("gen_domain", "printf 'domain\\n' > \"$out\"");
    let surface = ws.write_generator("mksurfdata", "echo 'no raw data for PFT' >&2; exit 1");
    let machine = machine_with(domain, surface, &ws.root().join("cache"));
    let recipe = RecipeLoader::load(&recipe_path).unwrap();
    let pipeline = pipeline(machine, ws.root()).with_output(Some(ws.output_dir()));

    let err = pipeline.run(&recipe, &SilentSink).unwrap_err();
    assert_eq!(err.exit_code(), 3);
    let SitepackError::ExternalTool(failure) = err else {
        panic!("expected tool failure");
    };
    assert_eq!(failure.tool, "surface-generator");
    assert_eq!(failure.kind, ToolFailureKind::ExitStatus(Some(1)));
    assert!(failure.diagnostics.contains("no raw data for PFT"));
    assert!(!ws.output_dir().join("inputdata").exists());
    assert!(!ws.output_dir().join("site_metadata").exists());
}

#[test]
fn missing_generator_fails_before_scratch() {
    let (ws, recipe_path) = prepared((1991, 1991));
    let machine = machine_with(
        ws.root().join("bin/absent_domain"),
        ws.root().join("bin/absent_surface"),
        &ws.root().join("cache"),
    );
    let recipe = RecipeLoader::load(&recipe_path).unwrap();
    let pipeline = pipeline(machine, ws.root()).with_output(Some(ws.output_dir()));

    let err = pipeline.run(&recipe, &SilentSink).unwrap_err();
    assert_matches!(
        err,
        SitepackError::ExternalTool(ref failure) if failure.kind == ToolFailureKind::NotInstalled
    );
    assert!(!ws.output_dir().exists());
}

#[test]
fn remote_gzipped_surface_is_downloaded_and_recorded() {
    let (ws, recipe_path) = prepared((1991, 1991));
    let mirror = ws.root().join("mirror");
    fs::create_dir_all(&mirror).unwrap();
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    std::io::Write::write_all(
        &mut encoder,
        &serde_json::to_vec(&regular_grid(None)).unwrap(),
    )
    .unwrap();
    fs::write(mirror.join("surfdata_0.5x0.5.nc.gz"), encoder.finish().unwrap()).unwrap();

    let local = ws.data_dir().join("surface").join("surfdata_0.5x0.5.nc");
    let content = fs::read_to_string(&recipe_path).unwrap().replace(
        &format!("path: {}", local.display()),
        "url: https://data.example.org/grids/surfdata_0.5x0.5.nc.gz",
    );
    fs::write(&recipe_path, content).unwrap();
    fs::remove_file(&local).unwrap();

    let recipe = RecipeLoader::load(&recipe_path).unwrap();
    let pipeline = pipeline(ws.machine(), &mirror).with_output(Some(ws.output_dir()));
    let outcome = pipeline.run(&recipe, &SilentSink).unwrap();

    let surface = outcome
        .manifest
        .provenance
        .iter()
        .find(|entry| !entry.source.contains("/data/atm"))
        .unwrap();
    assert!(surface.downloaded);
    assert_eq!(
        surface.source,
        "https://data.example.org/grids/surfdata_0.5x0.5.nc.gz"
    );
    assert!(outcome.manifest.entry(ArtifactKind::Surface).is_some());
    let cached: Vec<_> = fs::read_dir(ws.root().join("cache")).unwrap().collect();
    assert_eq!(cached.len(), 1);
}

#[test]
fn unreachable_download_is_dataset_not_found() {
    let (ws, recipe_path) = prepared((1991, 1991));
    let local = ws.data_dir().join("surface").join("surfdata_0.5x0.5.nc");
    let content = fs::read_to_string(&recipe_path).unwrap().replace(
        &format!("path: {}", local.display()),
        "url: https://data.example.org/grids/missing.nc",
    );
    fs::write(&recipe_path, content).unwrap();

    let recipe = RecipeLoader::load(&recipe_path).unwrap();
    let pipeline = pipeline(ws.machine(), ws.root()).with_output(Some(ws.output_dir()));
    let err = pipeline.run(&recipe, &SilentSink).unwrap_err();
    assert_matches!(
        err,
        SitepackError::DatasetNotFound { ref category, ref location }
            if category == "surface" && location.ends_with("missing.nc")
    );
}

#[test]
fn complete_profile_packages_every_ancillary() {
    let (ws, recipe_path) = prepared_complete();
    let recipe = RecipeLoader::load(&recipe_path).unwrap();
    let toolkit = FakeToolkit::default();
    let annotations = toolkit.annotations.clone();
    let fills = toolkit.fills.clone();
    let pipeline = pipeline_with(ws.machine(), ws.root(), toolkit).with_output(Some(ws.output_dir()));

    let outcome = pipeline.run(&recipe, &SilentSink).unwrap();

    assert_eq!(
        manifest_paths(&outcome.manifest),
        vec![
            "atm/cam/chem/trop_mozart_aero/aero/aerodep_FNS.nc",
            "atm/datm7/CLM1PT_data/1x1_FNS/FNS.Precip.1991-1991.nc",
            "atm/datm7/CLM1PT_data/1x1_FNS/FNS.Solar.1991-1991.nc",
            "atm/datm7/CLM1PT_data/1x1_FNS/FNS.TPQW.1991-1991.nc",
            "atm/datm7/NASA_LIS/lnfm_FNS.nc",
            "atm/datm7/topo_forcing/topo_FNS.nc",
            "lnd/clm2/firedata/abm_FNS.nc",
            "lnd/clm2/firedata/popdens_FNS.nc",
            "lnd/clm2/surfdata_map/1x1_FNS/surfdata_1x1_FNS.nc",
            "lnd/clm2/urbandata/urban_properties_FNS.nc",
            "share/domains/1x1_FNS/domain.lnd.1x1_FNS.nc",
        ]
    );
    for category in [
        DatasetCategory::Fire,
        DatasetCategory::Population,
        DatasetCategory::Urban,
    ] {
        assert!(
            outcome
                .manifest
                .artifacts
                .iter()
                .any(|entry| entry.kind == ArtifactKind::Ancillary && entry.category == Some(category)),
            "{category}"
        );
    }

    let fills = fills.borrow();
    assert_eq!(fills.len(), 1);
    let (path, variable, value) = &fills[0];
    assert!(path.ends_with("atm/datm7/topo_forcing/topo_FNS.nc"));
    assert_eq!(variable, TOPOGRAPHY_VARIABLE);
    assert_eq!(*value, 1210.0);
    assert!(annotations.borrow().iter().any(|(path, attributes)| {
        path.ends_with("topo_FNS.nc")
            && attributes.contains(&("site_elevation".to_string(), "1210".to_string()))
    }));

    let entries = archive_entries(&outcome.archive);
    assert_eq!(entries.len(), outcome.manifest.artifacts.len() + 1);
    let urban: GridDescriptor = serde_json::from_slice(
        &entries["inputdata/lnd/clm2/urbandata/urban_properties_FNS.nc"],
    )
    .unwrap();
    assert_eq!(urban.origin().unwrap().lat, 60.25);
}

#[test]
fn complete_profile_without_fire_is_incomplete() {
    let (ws, recipe_path) = prepared_complete();
    let mut recipe = RecipeLoader::load(&recipe_path).unwrap();
    recipe.sources.remove(&DatasetCategory::Fire);
    let pipeline = pipeline(ws.machine(), ws.root()).with_output(Some(ws.output_dir()));

    let err = pipeline.run(&recipe, &SilentSink).unwrap_err();
    assert_matches!(
        err,
        SitepackError::IncompletePackage { ref missing } if missing == &vec!["fire".to_string()]
    );
    assert!(!ws.output_dir().exists());
}

#[test]
fn curvilinear_sources_select_the_nearest_point() {
    let layout = GridLayout::Curvilinear {
        row_dim: "y".to_string(),
        col_dim: "x".to_string(),
        ncols: 2,
        lat: vec![59.8, 60.05, 60.3, 60.4],
        lon: vec![10.8, 11.15, 10.7, 11.2],
    };
    let ws = Workspace::new();
    ws.write_forcing_on(1991, 1991, &layout);
    ws.write_surface_on(&layout);
    let domain = ws.write_generator("gen_domain", "printf 'domain\\n' > \"$out\"");
    let surface = ws.write_generator("mksurfdata", "cp \"$src\" \"$out\"");
    let machine = machine_with(domain, surface, &ws.root().join("cache"));
    let recipe_path = ws.write_recipe("fns.yaml", "FNS", 60.1, 11.1, (1991, 1991));
    let recipe = RecipeLoader::load(&recipe_path).unwrap();
    let toolkit = FakeToolkit::default();
    let annotations = toolkit.annotations.clone();
    let pipeline = pipeline_with(machine, ws.root(), toolkit).with_output(Some(ws.output_dir()));

    let outcome = pipeline.run(&recipe, &SilentSink).unwrap();

    let entries = archive_entries(&outcome.archive);
    let surface: GridDescriptor = serde_json::from_slice(
        &entries["inputdata/lnd/clm2/surfdata_map/1x1_FNS/surfdata_1x1_FNS.nc"],
    )
    .unwrap();
    assert_eq!(
        surface.layout,
        GridLayout::Curvilinear {
            row_dim: "y".to_string(),
            col_dim: "x".to_string(),
            ncols: 1,
            lat: vec![60.05],
            lon: vec![11.15],
        }
    );
    let tpqw: GridDescriptor = serde_json::from_slice(
        &entries["inputdata/atm/datm7/CLM1PT_data/1x1_FNS/FNS.TPQW.1991-1991.nc"],
    )
    .unwrap();
    assert_matches!(tpqw.layout, GridLayout::Curvilinear { ref lat, ncols: 1, .. } if lat == &vec![60.05]);
    assert_eq!(tpqw.time.unwrap().values.len(), 24);
    let annotations = annotations.borrow();
    assert!(annotations.iter().all(|(_, attributes)| {
        attributes.contains(&("selected_cell".to_string(), "60.05,11.15".to_string()))
    }));
}

#[test]
fn unstructured_sources_select_the_nearest_cell() {
    let layout = GridLayout::Unstructured {
        cell_dim: "ncol".to_string(),
        lat: vec![59.0, 60.05, 61.0],
        lon: vec![10.0, 11.15, 12.0],
    };
    let ws = Workspace::new();
    ws.write_forcing_on(1991, 1991, &layout);
    ws.write_surface_on(&layout);
    let domain = ws.write_generator("gen_domain", "printf 'domain\\n' > \"$out\"");
    let surface = ws.write_generator("mksurfdata", "cp \"$src\" \"$out\"");
    let machine = machine_with(domain, surface, &ws.root().join("cache"));
    let recipe_path = ws.write_recipe("fns.yaml", "FNS", 60.1, 11.1, (1991, 1991));
    let recipe = RecipeLoader::load(&recipe_path).unwrap();
    let pipeline = pipeline(machine, ws.root()).with_output(Some(ws.output_dir()));

    let outcome = pipeline.run(&recipe, &SilentSink).unwrap();

    let entries = archive_entries(&outcome.archive);
    let expected = GridLayout::Unstructured {
        cell_dim: "ncol".to_string(),
        lat: vec![60.05],
        lon: vec![11.15],
    };
    for path in manifest_paths(&outcome.manifest) {
        if path.starts_with("share/domains") {
            continue;
        }
        let descriptor: GridDescriptor =
            serde_json::from_slice(&entries[&format!("inputdata/{path}")]).unwrap();
        assert_eq!(descriptor.layout, expected, "{path}");
    }
}

#[test]
fn unstructured_site_beyond_tolerance_is_rejected() {
    let layout = GridLayout::Unstructured {
        cell_dim: "ncol".to_string(),
        lat: vec![40.0, 41.0],
        lon: vec![10.0, 11.0],
    };
    let ws = Workspace::new();
    ws.write_forcing_on(1991, 1991, &layout);
    ws.write_surface_on(&layout);
    let recipe_path = ws.write_recipe("fns.yaml", "FNS", 60.1, 11.1, (1991, 1991));
    let recipe = RecipeLoader::load(&recipe_path).unwrap();
    let pipeline = pipeline(ws.machine(), ws.root()).with_output(Some(ws.output_dir()));

    let err = pipeline.run(&recipe, &SilentSink).unwrap_err();
    assert_matches!(err, SitepackError::CoordinateOutOfDomain { .. });
    assert!(!ws.output_dir().exists());
}

#[test]
fn mislabelled_month_is_rejected_before_any_work() {
    let (ws, recipe_path) = prepared((1991, 1991));
    write_grid(
        &ws.forcing_file("TPQW", 1991, 3),
        &regular_grid(Some(month_values(1991, 4))),
    );
    let recipe = RecipeLoader::load(&recipe_path).unwrap();
    let pipeline = pipeline(ws.machine(), ws.root()).with_output(Some(ws.output_dir()));

    let err = pipeline.run(&recipe, &SilentSink).unwrap_err();
    assert_matches!(
        err,
        SitepackError::TemporalCoverage { ref group, year: 1991, ref detail }
            if group == "TPQW" && detail.starts_with("1991-03") && detail.contains("1991-04-01")
    );
    assert!(!ws.output_dir().exists());
}

#[test]
fn shared_grid_files_replace_generated_domain() {
    let ws = Workspace::new();
    ws.write_forcing(1991, 1991);
    ws.write_surface();
    let grids = ws.root().join("grids");
    fs::create_dir_all(&grids).unwrap();
    fs::write(grids.join("domain.lnd.FNS.nc"), b"prebuilt domain\n").unwrap();
    fs::write(grids.join("SCRIPgrid_FNS.nc"), b"scrip\n").unwrap();
    fs::write(grids.join("map_FNS_to_0.5x0.5.nc"), b"map\n").unwrap();
    let domain = ws.write_generator("gen_domain", "echo 'domain generator must not run' >&2; exit 1");
    let surface = ws.write_generator(
        "mksurfdata",
        "[ -n \"$dom\" ] && cp \"$dom\" \"$out\"",
    );
    let machine = machine_with(domain, surface, &ws.root().join("cache"));
    let extra = format!(
        "shared:\n  domain: {grids}/domain.lnd.FNS.nc\n  scrip: {grids}/SCRIPgrid_FNS.nc\n  mapping: {grids}/map_FNS_to_0.5x0.5.nc\n",
        grids = grids.display()
    );
    let recipe_path = ws.write_recipe_with("fns.yaml", "FNS", 60.1, 11.1, (1991, 1991), &extra);
    let recipe = RecipeLoader::load(&recipe_path).unwrap();
    let pipeline = pipeline(machine, ws.root()).with_output(Some(ws.output_dir()));

    let outcome = pipeline.run(&recipe, &SilentSink).unwrap();

    let entries = archive_entries(&outcome.archive);
    assert_eq!(
        entries["inputdata/share/domains/1x1_FNS/domain.lnd.1x1_FNS.nc"],
        b"prebuilt domain\n"
    );
    assert_eq!(
        entries["inputdata/lnd/clm2/surfdata_map/1x1_FNS/surfdata_1x1_FNS.nc"],
        b"prebuilt domain\n"
    );
    assert_eq!(
        entries["inputdata/share/scripgrids/1x1_FNS/SCRIPgrid_FNS.nc"],
        b"scrip\n"
    );
    assert_eq!(
        entries["inputdata/lnd/clm2/mappingdata/maps/1x1_FNS/map_FNS_to_0.5x0.5.nc"],
        b"map\n"
    );
    let domain = outcome.manifest.entry(ArtifactKind::Domain).unwrap();
    assert_eq!(domain.produced_by, "shared");
    assert!(outcome.manifest.entry(ArtifactKind::Scrip).is_some());
    assert!(outcome.manifest.entry(ArtifactKind::Mapping).is_some());
}

#[test]
fn missing_shared_file_is_reported_before_any_work() {
    let (ws, recipe_path) = prepared((1991, 1991));
    let absent = ws.root().join("grids/domain.lnd.FNS.nc");
    let mut content = fs::read_to_string(&recipe_path).unwrap();
    content.push_str(&format!("shared:\n  domain: {}\n", absent.display()));
    fs::write(&recipe_path, content).unwrap();
    let recipe = RecipeLoader::load(&recipe_path).unwrap();
    let pipeline = pipeline(ws.machine(), ws.root()).with_output(Some(ws.output_dir()));

    let err = pipeline.run(&recipe, &SilentSink).unwrap_err();
    assert_matches!(
        err,
        SitepackError::DatasetNotFound { ref category, ref location }
            if category == "shared.domain" && location.ends_with("domain.lnd.FNS.nc")
    );
    assert!(!ws.output_dir().exists());
}

/// Occupies the archive's destination with a non-empty directory so the
/// final rename fails.
fn block_archive(ws: &Workspace, version: &str) {
    let blocker = ws
        .output_dir()
        .join(format!("inputdata/inputdata_version{version}_FNS.tar"));
    fs::create_dir_all(&blocker).unwrap();
    fs::write(blocker.join("occupied"), b"").unwrap();
}

#[test]
fn failed_archive_publish_leaves_no_metadata() {
    let (ws, recipe_path) = prepared((1991, 1991));
    block_archive(&ws, "1.0.0");
    let recipe = RecipeLoader::load(&recipe_path).unwrap();
    let pipeline = pipeline(ws.machine(), ws.root()).with_output(Some(ws.output_dir()));

    let err = pipeline.run(&recipe, &SilentSink).unwrap_err();
    assert_matches!(err, SitepackError::Filesystem(_));
    assert!(!ws.output_dir().join("site_metadata/FNS").exists());
}

#[test]
fn failed_archive_publish_restores_earlier_metadata() {
    let (ws, recipe_path) = prepared((1991, 1991));
    let recipe = RecipeLoader::load(&recipe_path).unwrap();
    let pipeline = pipeline(ws.machine(), ws.root()).with_output(Some(ws.output_dir()));
    let first = pipeline.run(&recipe, &SilentSink).unwrap();
    let fragment = fs::read(first.metadata_dir.join("fragment.json")).unwrap();

    let content = fs::read_to_string(&recipe_path)
        .unwrap()
        .replace("version: 1.0.0", "version: 1.1.0");
    fs::write(&recipe_path, content).unwrap();
    block_archive(&ws, "1.1.0");
    let recipe = RecipeLoader::load(&recipe_path).unwrap();

    pipeline.run(&recipe, &SilentSink).unwrap_err();
    assert_eq!(fs::read(first.metadata_dir.join("fragment.json")).unwrap(), fragment);
    assert!(first.archive.is_file());
}
