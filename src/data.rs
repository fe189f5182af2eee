//! Loading and joining of the raw census and election source tables.
//!
//! The sources are the OpenElections 2016 precinct-level results file, the
//! CVAP block-group demographic extract, a block-level geokeys table that
//! links census block groups to voting divisions, a block-to-congressional-
//! district assignment, and a hand-curated override table for division
//! identifiers the automatic crosswalk cannot reconcile.
//!
//! All joins are single-pass and sequential. A missing source file or an
//! election division that cannot be resolved through the crosswalk is a hard
//! error; those gaps require manual curation of the crosswalk, not retries.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use csv::{ReaderBuilder, StringRecord};
use log::{debug, info};

use crate::error::{Error, Result};

pub const ELECTION_FILENAME: &str = "20161108__nc__general__precinct__raw.csv";
pub const DEMOGRAPHIC_FILENAME: &str = "BlockGr.csv";
pub const GEOKEYS_FILENAME: &str = "Block_Level_GeoKeys.tab";
pub const MANUAL_MAPPING_FILENAME: &str = "manual_mapping.tsv";
pub const CONGRESSIONAL_FILENAME: &str = "block_cd.csv";

pub const DEFAULT_OFFICE: &str = "US HOUSE OF REPRESENTATIVES";

/// CVAP geoid prefix selecting North Carolina block groups.
const NC_GEOID_PREFIX: &str = "15000US37";

/// Locations of the raw source files under one data directory.
#[derive(Debug, Clone)]
pub struct DataPaths {
    pub data_dir: PathBuf,
}

impl DataPaths {
    pub fn new<P: Into<PathBuf>>(data_dir: P) -> Self {
        Self { data_dir: data_dir.into() }
    }

    pub fn election(&self) -> PathBuf {
        self.data_dir.join(ELECTION_FILENAME)
    }

    pub fn demographics(&self) -> PathBuf {
        self.data_dir.join(DEMOGRAPHIC_FILENAME)
    }

    pub fn geokeys(&self) -> PathBuf {
        self.data_dir.join(GEOKEYS_FILENAME)
    }

    pub fn manual_mapping(&self) -> PathBuf {
        self.data_dir.join(MANUAL_MAPPING_FILENAME)
    }

    pub fn congressional(&self) -> PathBuf {
        self.data_dir.join(CONGRESSIONAL_FILENAME)
    }
}

/// One row of the cleaned per-precinct table.
///
/// Populations are fractional because block-group counts are apportioned
/// across the divisions a block group intersects; vote counts stay integral.
#[derive(Debug, Clone, PartialEq)]
pub struct PrecinctRecord {
    pub division: String,
    pub district: u32,
    pub label: String,
    pub white: f64,
    pub black: f64,
    pub hispanic: f64,
    pub other: f64,
    pub total: f64,
    pub dem: u64,
    pub lib: u64,
    pub rep: u64,
    pub total_votes: u64,
}

impl PrecinctRecord {
    /// Share of the citizen voting-age population that is not White Alone.
    pub fn pct_minority(&self) -> f64 {
        if self.total <= 0.0 {
            0.0
        } else {
            ((self.total - self.white) / self.total).clamp(0.0, 1.0)
        }
    }

    /// Two-party ballot count used as the Binomial trial count.
    pub fn two_party_ballots(&self) -> u64 {
        self.dem + self.rep
    }
}

/// The cleaned precinct table, one row per (division, district).
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PrecinctTable {
    pub records: Vec<PrecinctRecord>,
}

impl PrecinctTable {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Sorted unique congressional districts present in the table.
    pub fn districts(&self) -> Vec<u32> {
        let set: BTreeSet<u32> = self.records.iter().map(|r| r.district).collect();
        set.into_iter().collect()
    }

    pub fn district_records(&self, district: u32) -> Vec<&PrecinctRecord> {
        self.records.iter().filter(|r| r.district == district).collect()
    }

    /// Integrity checks on the joined table: race-category populations sum
    /// to the reported total (within rounding), party votes sum to total
    /// votes cast, and all counts are non-negative.
    pub fn validate(&self) -> Result<()> {
        for rec in &self.records {
            let pop_sum = rec.white + rec.black + rec.hispanic + rec.other;
            if (pop_sum - rec.total).abs() > 0.5 {
                return Err(Error::Integrity(format!(
                    "{}: race populations sum to {pop_sum:.2}, total is {:.2}",
                    rec.division, rec.total
                )));
            }
            if rec.total < 0.0 || rec.white < 0.0 || rec.black < 0.0 || rec.hispanic < 0.0 {
                return Err(Error::Integrity(format!(
                    "{}: negative population count",
                    rec.division
                )));
            }
            if rec.dem + rec.lib + rec.rep != rec.total_votes {
                return Err(Error::Integrity(format!(
                    "{}: party votes sum to {}, total votes cast is {}",
                    rec.division,
                    rec.dem + rec.lib + rec.rep,
                    rec.total_votes
                )));
            }
        }
        Ok(())
    }
}

/// Aggregated votes for one (division, district) cell.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ElectionTotals {
    pub dem: u64,
    pub lib: u64,
    pub rep: u64,
}

/// Citizen voting-age population of one census block group.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct BlockGroupDemo {
    pub white: f64,
    pub black: f64,
    pub hispanic: f64,
    pub other: f64,
    pub total: f64,
}

/// One deduplicated crosswalk row linking a census block to a division.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct CrosswalkRow {
    pub block_key: u64,
    pub bg_key: u64,
    pub division: String,
}

fn open_reader(path: &Path, delimiter: u8, has_headers: bool) -> Result<csv::Reader<std::fs::File>> {
    if !path.exists() {
        return Err(Error::MissingInput(path.to_path_buf()));
    }
    Ok(ReaderBuilder::new()
        .delimiter(delimiter)
        .has_headers(has_headers)
        .flexible(true)
        .from_path(path)?)
}

fn col(headers: &StringRecord, name: &str, path: &Path) -> Result<usize> {
    headers
        .iter()
        .position(|h| h == name)
        .ok_or_else(|| Error::MissingColumn(name.to_string(), path.to_path_buf()))
}

fn parse_field<T: FromStr>(record: &StringRecord, idx: usize, path: &Path, what: &str) -> Result<T> {
    let raw = record.get(idx).unwrap_or("");
    raw.trim().parse().map_err(|_| Error::MalformedRow {
        file: path.to_path_buf(),
        detail: format!("cannot parse {what} from {raw:?}"),
    })
}

/// Read the hand-curated division override table (tab-separated, no header:
/// raw division, corrected division).
pub fn load_manual_mapping(path: &Path) -> Result<HashMap<String, String>> {
    let mut reader = open_reader(path, b'\t', false)?;
    let mut mapping = HashMap::new();
    for record in reader.records() {
        let record = record?;
        let (Some(from), Some(to)) = (record.get(0), record.get(1)) else {
            return Err(Error::MalformedRow {
                file: path.to_path_buf(),
                detail: "expected two tab-separated columns".to_string(),
            });
        };
        mapping.insert(from.trim().to_string(), to.trim().to_string());
    }
    Ok(mapping)
}

/// Load the OpenElections precinct results for one office, aggregated by
/// party and pivoted to one `ElectionTotals` per (division, district).
///
/// Division identifiers are rewritten through the manual override table
/// before aggregation, matching the curated crosswalk.
pub fn load_election_results(
    path: &Path,
    manual: &HashMap<String, String>,
    office: &str,
) -> Result<BTreeMap<(String, u32), ElectionTotals>> {
    let mut reader = open_reader(path, b',', true)?;
    let headers = reader.headers()?.clone();
    let office_idx = col(&headers, "office", path)?;
    let party_idx = col(&headers, "party", path)?;
    let division_idx = col(&headers, "division", path)?;
    let district_idx = col(&headers, "district", path)?;
    let votes_idx = col(&headers, "votes", path)?;

    let mut offices_seen = BTreeSet::new();
    let mut totals: BTreeMap<(String, u32), ElectionTotals> = BTreeMap::new();
    for record in reader.records() {
        let record = record?;
        let row_office = record.get(office_idx).unwrap_or("").trim();
        offices_seen.insert(row_office.to_string());
        if row_office != office {
            continue;
        }
        let district: u32 = parse_field(&record, district_idx, path, "district")?;
        let votes: u64 = parse_field(&record, votes_idx, path, "votes")?;
        let mut division = record.get(division_idx).unwrap_or("").trim().to_string();
        if let Some(corrected) = manual.get(&division) {
            division = corrected.clone();
        }
        let entry = totals.entry((division, district)).or_default();
        match record.get(party_idx).unwrap_or("").trim() {
            "DEM" => entry.dem += votes,
            "LIB" => entry.lib += votes,
            "REP" => entry.rep += votes,
            other => debug!("ignoring votes for party {other:?}"),
        }
    }

    if totals.is_empty() {
        let available = offices_seen.into_iter().collect::<Vec<_>>().join(", ");
        return Err(Error::UnknownOffice(office.to_string(), available));
    }
    info!("loaded election results for {} (division, district) cells", totals.len());
    Ok(totals)
}

/// Load the CVAP block-group extract for North Carolina, aggregating the
/// estimate column per block group and race category.
///
/// The geoid has the form `15000USsscccttttttb`; the 12-digit suffix is the
/// block-group key. The residual "Other" category is derived so that the
/// categories sum to the reported total.
pub fn load_demographics(path: &Path) -> Result<HashMap<u64, BlockGroupDemo>> {
    let mut reader = open_reader(path, b',', true)?;
    // The source file is latin-1 encoded; go through byte records and decode
    // the fields we touch lossily.
    let headers = reader.byte_headers()?.clone();
    let find = |name: &str| -> Result<usize> {
        headers
            .iter()
            .position(|h| h == name.as_bytes())
            .ok_or_else(|| Error::MissingColumn(name.to_string(), path.to_path_buf()))
    };
    let geoid_idx = find("geoid")?;
    let lntitle_idx = find("lntitle")?;
    let est_idx = find("CVAP_EST")?;

    let mut demo: HashMap<u64, BlockGroupDemo> = HashMap::new();
    for record in reader.byte_records() {
        let record = record?;
        let geoid = String::from_utf8_lossy(record.get(geoid_idx).unwrap_or(b""));
        let geoid = geoid.trim();
        if !geoid.starts_with(NC_GEOID_PREFIX) {
            continue;
        }
        let key_digits = &geoid["15000US".len()..];
        if key_digits.len() != 12 {
            return Err(Error::MalformedRow {
                file: path.to_path_buf(),
                detail: format!("geoid {geoid:?} does not carry a 12-digit block-group key"),
            });
        }
        let bg_key: u64 = key_digits.parse().map_err(|_| Error::MalformedRow {
            file: path.to_path_buf(),
            detail: format!("cannot parse block-group key from geoid {geoid:?}"),
        })?;
        let est_raw = String::from_utf8_lossy(record.get(est_idx).unwrap_or(b""));
        let est: f64 = est_raw.trim().parse().map_err(|_| Error::MalformedRow {
            file: path.to_path_buf(),
            detail: format!("cannot parse CVAP_EST from {est_raw:?}"),
        })?;
        let entry = demo.entry(bg_key).or_default();
        match String::from_utf8_lossy(record.get(lntitle_idx).unwrap_or(b"")).trim() {
            "White Alone" => entry.white += est,
            "Black or African American Alone" => entry.black += est,
            "Hispanic or Latino" => entry.hispanic += est,
            "Total" => entry.total += est,
            _ => {}
        }
    }

    for entry in demo.values_mut() {
        entry.other = entry.total - (entry.white + entry.black + entry.hispanic);
    }
    info!("loaded demographics for {} block groups", demo.len());
    Ok(demo)
}

/// Load the block-level geokeys table and construct division identifiers
/// from the county name and VTD code, deduplicated.
pub fn load_crosswalk(path: &Path) -> Result<Vec<CrosswalkRow>> {
    let mut reader = open_reader(path, b'\t', true)?;
    let headers = reader.headers()?.clone();
    let block_idx = col(&headers, "Block_Key", path)?;
    let county_idx = col(&headers, "Cnty_Name", path)?;
    let vtd_idx = col(&headers, "VTD_Code", path)?;
    let bg_idx = col(&headers, "BG_Key", path)?;

    let mut rows = BTreeSet::new();
    for record in reader.records() {
        let record = record?;
        let block_key: u64 = parse_field(&record, block_idx, path, "Block_Key")?;
        let bg_key: u64 = parse_field(&record, bg_idx, path, "BG_Key")?;
        let county = record.get(county_idx).unwrap_or("").trim().to_lowercase();
        let vtd = record.get(vtd_idx).unwrap_or("").trim().to_lowercase();
        let division =
            format!("ocd-division/country:us/state:nc/county:{county}/precinct:{vtd}");
        rows.insert(CrosswalkRow { block_key, bg_key, division });
    }
    info!("loaded {} crosswalk rows", rows.len());
    Ok(rows.into_iter().collect())
}

/// Load the block-to-congressional-district assignment (no header: block
/// key, district).
pub fn load_congressional_map(path: &Path) -> Result<HashMap<u64, u32>> {
    let mut reader = open_reader(path, b',', false)?;
    let mut map = HashMap::new();
    for record in reader.records() {
        let record = record?;
        let block_key: u64 = parse_field(&record, 0, path, "block key")?;
        let district: u32 = parse_field(&record, 1, path, "district")?;
        map.insert(block_key, district);
    }
    Ok(map)
}

/// Apportion block-group populations across divisions and join with the
/// election totals.
///
/// Each block group's population is split across the (division, district)
/// cells it intersects, proportionally to the number of blocks in each cell.
/// Election cells with no demographic counterpart are returned as the
/// unresolved list rather than silently dropped.
pub fn build_precinct_table(
    election: &BTreeMap<(String, u32), ElectionTotals>,
    demo: &HashMap<u64, BlockGroupDemo>,
    crosswalk: &[CrosswalkRow],
    district_by_block: &HashMap<u64, u32>,
) -> (PrecinctTable, Vec<String>) {
    // Per block group: total blocks, and blocks per (division, district).
    let mut bg_blocks: HashMap<u64, usize> = HashMap::new();
    let mut cell_blocks: BTreeMap<(u64, String, u32), usize> = BTreeMap::new();
    for row in crosswalk {
        let Some(&district) = district_by_block.get(&row.block_key) else {
            continue;
        };
        if !demo.contains_key(&row.bg_key) {
            continue;
        }
        *bg_blocks.entry(row.bg_key).or_default() += 1;
        *cell_blocks
            .entry((row.bg_key, row.division.clone(), district))
            .or_default() += 1;
    }

    let mut populations: BTreeMap<(String, u32), BlockGroupDemo> = BTreeMap::new();
    for ((bg_key, division, district), &count) in &cell_blocks {
        let base = demo[bg_key];
        let share = count as f64 / bg_blocks[bg_key] as f64;
        let cell = populations.entry((division.clone(), *district)).or_default();
        cell.white += base.white * share;
        cell.black += base.black * share;
        cell.hispanic += base.hispanic * share;
        cell.other += base.other * share;
        cell.total += base.total * share;
    }

    let mut records = Vec::new();
    let mut unresolved = Vec::new();
    for ((division, district), votes) in election {
        let Some(pop) = populations.get(&(division.clone(), *district)) else {
            unresolved.push(division.clone());
            continue;
        };
        records.push(PrecinctRecord {
            division: division.clone(),
            district: *district,
            label: division_to_label(division),
            white: pop.white,
            black: pop.black,
            hispanic: pop.hispanic,
            other: pop.other,
            total: pop.total,
            dem: votes.dem,
            lib: votes.lib,
            rep: votes.rep,
            total_votes: votes.dem + votes.lib + votes.rep,
        });
    }
    records.sort_by(|a, b| (a.district, &a.division).cmp(&(b.district, &b.division)));
    (PrecinctTable { records }, unresolved)
}

/// Load every source under `paths` and produce the validated precinct table.
///
/// Halts with `Error::UnresolvedDivisions` if any election division fails
/// to resolve; those entries need a row in the manual mapping file.
pub fn make_precinct_table(paths: &DataPaths, office: &str) -> Result<PrecinctTable> {
    let manual = load_manual_mapping(&paths.manual_mapping())?;
    let election = load_election_results(&paths.election(), &manual, office)?;
    let demo = load_demographics(&paths.demographics())?;
    let crosswalk = load_crosswalk(&paths.geokeys())?;
    let districts = load_congressional_map(&paths.congressional())?;

    let (table, unresolved) = build_precinct_table(&election, &demo, &crosswalk, &districts);
    if !unresolved.is_empty() {
        return Err(Error::UnresolvedDivisions(unresolved));
    }
    table.validate()?;
    info!("built precinct table with {} rows", table.len());
    Ok(table)
}

/// Human-readable "County (Precinct)" label for a division identifier.
pub fn division_to_label(division: &str) -> String {
    let field = |key: &str| {
        division
            .split('/')
            .find_map(|segment| segment.strip_prefix(key))
    };
    match (field("county:"), field("precinct:")) {
        (Some(county), Some(precinct)) => {
            format!("{} ({})", title_case(county), title_case(precinct))
        }
        _ => "None (None)".to_string(),
    }
}

fn title_case(s: &str) -> String {
    s.split_whitespace()
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}
