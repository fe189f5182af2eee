//! End-to-end tests of the data loader over small synthetic source files.

use std::fs;
use std::path::PathBuf;

use ecoinfer_re::data::{
    build_precinct_table, load_congressional_map, load_crosswalk, load_demographics,
    load_election_results, load_manual_mapping, make_precinct_table, DataPaths, DEFAULT_OFFICE,
};
use ecoinfer_re::Error;

const WAKE_01_01: &str = "ocd-division/country:us/state:nc/county:wake/precinct:01-01";
const WAKE_01_02: &str = "ocd-division/country:us/state:nc/county:wake/precinct:01-02";
const WAKE_TYPO: &str = "ocd-division/country:us/state:nc/county:wake/precinct:1-2";
const DURHAM_ORPHAN: &str = "ocd-division/country:us/state:nc/county:durham/precinct:x";

/// Write a complete synthetic source set under a fresh directory.
///
/// Block group ...001 spans two blocks split across precincts 01-01 and
/// 01-02; block group ...002 has a single block in 01-01. The election file
/// contains a misspelled division fixed by the manual mapping, plus rows
/// for another office that must be filtered out.
fn write_sources(name: &str, with_orphan: bool) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("ecoinfer_data_{name}"));
    let _ = fs::remove_dir_all(&dir);
    fs::create_dir_all(&dir).unwrap();
    let paths = DataPaths::new(&dir);

    let mut election = String::from("county,office,party,division,district,votes\n");
    // Split DEM rows exercise aggregation across candidates.
    election.push_str(&format!("WAKE,{DEFAULT_OFFICE},DEM,{WAKE_01_01},4,350\n"));
    election.push_str(&format!("WAKE,{DEFAULT_OFFICE},DEM,{WAKE_01_01},4,250\n"));
    election.push_str(&format!("WAKE,{DEFAULT_OFFICE},REP,{WAKE_01_01},4,400\n"));
    election.push_str(&format!("WAKE,{DEFAULT_OFFICE},LIB,{WAKE_01_01},4,20\n"));
    election.push_str(&format!("WAKE,{DEFAULT_OFFICE},DEM,{WAKE_01_02},4,100\n"));
    election.push_str(&format!("WAKE,{DEFAULT_OFFICE},REP,{WAKE_01_02},4,200\n"));
    // Misspelled division, corrected by the manual mapping below.
    election.push_str(&format!("WAKE,{DEFAULT_OFFICE},REP,{WAKE_TYPO},4,50\n"));
    // Another office entirely; must not leak into the table.
    election.push_str(&format!("WAKE,US SENATE,DEM,{WAKE_01_01},4,9999\n"));
    if with_orphan {
        election.push_str(&format!("DURHAM,{DEFAULT_OFFICE},DEM,{DURHAM_ORPHAN},1,10\n"));
    }
    fs::write(paths.election(), election).unwrap();

    fs::write(paths.manual_mapping(), format!("{WAKE_TYPO}\t{WAKE_01_02}\n")).unwrap();

    let mut demo = String::from("geoid,lntitle,CVAP_EST\n");
    for (title, bg1, bg2) in [
        ("Total", 1000, 500),
        ("White Alone", 600, 100),
        ("Black or African American Alone", 300, 350),
        ("Hispanic or Latino", 50, 25),
    ] {
        demo.push_str(&format!("15000US371830501001,{title},{bg1}\n"));
        demo.push_str(&format!("15000US371830501002,{title},{bg2}\n"));
        // A non-NC block group that must be filtered out.
        demo.push_str(&format!("15000US011830501001,{title},77\n"));
    }
    fs::write(paths.demographics(), demo).unwrap();

    let geokeys = "Block_Key\tCnty_Name\tVTD_Code\tBG_Key\tCnty_Code\n\
                   1\tWAKE\t01-01\t371830501001\t183\n\
                   2\tWAKE\t01-02\t371830501001\t183\n\
                   3\tWAKE\t01-01\t371830501002\t183\n";
    fs::write(paths.geokeys(), geokeys).unwrap();

    fs::write(paths.congressional(), "1,4\n2,4\n3,4\n").unwrap();
    dir
}

#[test]
fn builds_table_with_apportioned_populations() {
    let dir = write_sources("build", false);
    let table = make_precinct_table(&DataPaths::new(&dir), DEFAULT_OFFICE).unwrap();

    assert_eq!(table.len(), 2);
    assert_eq!(table.districts(), vec![4]);

    let p1 = table.records.iter().find(|r| r.division == WAKE_01_01).unwrap();
    // Half of block group ...001 plus all of ...002.
    assert!((p1.total - 1000.0).abs() < 1e-9);
    assert!((p1.white - 400.0).abs() < 1e-9);
    assert_eq!(p1.dem, 600);
    assert_eq!(p1.rep, 400);
    assert_eq!(p1.lib, 20);
    assert_eq!(p1.total_votes, 1020);
    assert!((p1.pct_minority() - 0.6).abs() < 1e-9);
    assert_eq!(p1.label, "Wake (01-01)");

    let p2 = table.records.iter().find(|r| r.division == WAKE_01_02).unwrap();
    assert!((p2.total - 500.0).abs() < 1e-9);
    // The misspelled division's votes landed here through the manual map.
    assert_eq!(p2.rep, 250);
    assert_eq!(p2.dem, 100);

    let _ = fs::remove_dir_all(dir);
}

#[test]
fn race_populations_sum_to_total() {
    let dir = write_sources("pop_sums", false);
    let table = make_precinct_table(&DataPaths::new(&dir), DEFAULT_OFFICE).unwrap();
    for rec in &table.records {
        let sum = rec.white + rec.black + rec.hispanic + rec.other;
        assert!(
            (sum - rec.total).abs() <= 0.5,
            "{}: categories sum to {sum}, total {}",
            rec.division,
            rec.total
        );
    }
    let _ = fs::remove_dir_all(dir);
}

#[test]
fn party_votes_sum_to_votes_cast() {
    let dir = write_sources("vote_sums", false);
    let table = make_precinct_table(&DataPaths::new(&dir), DEFAULT_OFFICE).unwrap();
    for rec in &table.records {
        assert_eq!(rec.dem + rec.lib + rec.rep, rec.total_votes, "{}", rec.division);
    }
    let _ = fs::remove_dir_all(dir);
}

#[test]
fn unresolved_division_is_flagged_then_fatal() {
    let dir = write_sources("orphan", true);
    let paths = DataPaths::new(&dir);

    // The low-level join reports the orphan explicitly.
    let manual = load_manual_mapping(&paths.manual_mapping()).unwrap();
    let election = load_election_results(&paths.election(), &manual, DEFAULT_OFFICE).unwrap();
    let demo = load_demographics(&paths.demographics()).unwrap();
    let crosswalk = load_crosswalk(&paths.geokeys()).unwrap();
    let districts = load_congressional_map(&paths.congressional()).unwrap();
    let (table, unresolved) = build_precinct_table(&election, &demo, &crosswalk, &districts);
    assert_eq!(unresolved, vec![DURHAM_ORPHAN.to_string()]);
    assert_eq!(table.len(), 2);

    // The top-level loader halts on the same gap.
    match make_precinct_table(&paths, DEFAULT_OFFICE) {
        Err(Error::UnresolvedDivisions(divs)) => assert_eq!(divs.len(), 1),
        other => panic!("expected UnresolvedDivisions, got {other:?}"),
    }

    let _ = fs::remove_dir_all(dir);
}

#[test]
fn every_resolved_division_maps_to_one_cell() {
    let dir = write_sources("resolve", false);
    let paths = DataPaths::new(&dir);
    let manual = load_manual_mapping(&paths.manual_mapping()).unwrap();
    let election = load_election_results(&paths.election(), &manual, DEFAULT_OFFICE).unwrap();
    let table = make_precinct_table(&paths, DEFAULT_OFFICE).unwrap();
    for (division, district) in election.keys() {
        let hits = table
            .records
            .iter()
            .filter(|r| &r.division == division && r.district == *district)
            .count();
        assert_eq!(hits, 1, "division {division} resolved {hits} times");
    }
    let _ = fs::remove_dir_all(dir);
}

#[test]
fn loading_twice_is_deterministic() {
    let dir = write_sources("determinism", false);
    let paths = DataPaths::new(&dir);
    let first = make_precinct_table(&paths, DEFAULT_OFFICE).unwrap();
    let second = make_precinct_table(&paths, DEFAULT_OFFICE).unwrap();
    assert_eq!(first, second);
    let _ = fs::remove_dir_all(dir);
}

#[test]
fn missing_source_file_is_reported() {
    let dir = std::env::temp_dir().join("ecoinfer_data_missing");
    let _ = fs::remove_dir_all(&dir);
    fs::create_dir_all(&dir).unwrap();
    match make_precinct_table(&DataPaths::new(&dir), DEFAULT_OFFICE) {
        Err(Error::MissingInput(path)) => assert!(path.starts_with(&dir)),
        other => panic!("expected MissingInput, got {other:?}"),
    }
    let _ = fs::remove_dir_all(dir);
}

#[test]
fn unknown_office_lists_alternatives() {
    let dir = write_sources("office", false);
    let paths = DataPaths::new(&dir);
    let manual = load_manual_mapping(&paths.manual_mapping()).unwrap();
    match load_election_results(&paths.election(), &manual, "GOVERNOR") {
        Err(Error::UnknownOffice(requested, available)) => {
            assert_eq!(requested, "GOVERNOR");
            assert!(available.contains("US SENATE"));
            assert!(available.contains(DEFAULT_OFFICE));
        }
        other => panic!("expected UnknownOffice, got {other:?}"),
    }
    let _ = fs::remove_dir_all(dir);
}
