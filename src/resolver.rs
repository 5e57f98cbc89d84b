//! Profile resolution.
//!
//! [`resolve_profile`] turns a batch of samples plus a partition's symbols
//! into a self-contained profile: every location, mapping, and function a
//! sample touches is dereferenced through the tables, strings included, and
//! linked by `Arc` so shared records appear once.
//!
//! Dereferences are memoized in per-call scratch vectors sized to the tables
//! (first lookup builds the record, later lookups are O(1)); the scratch dies
//! with the call, so resolution holds no global state and calls never share
//! buffers.

use std::sync::Arc;

use crate::block_reader::Symbols;
use crate::error::{Error, Result};
use crate::model::Samples;

/// Receives resolved locations, one call per stacktrace id.
///
/// The `locations` slice (leaf-first) is owned by the resolver and reused
/// between invocations: copy it if you need to keep it. For a sorted input
/// batch, invocations arrive in ascending id order, exactly once per input
/// id.
pub trait StacktraceSink {
    fn insert_stacktrace(&mut self, stacktrace_id: u32, locations: &[i32]) -> Result<()>;
}

/// A resolved profile. Samples reference locations; locations reference
/// their mapping and functions. The flat vectors list each record once, in
/// first-seen order.
#[derive(Debug, Clone, Default)]
pub struct Profile {
    pub sample: Vec<Sample>,
    pub location: Vec<Arc<ProfileLocation>>,
    pub mapping: Vec<Arc<ProfileMapping>>,
    pub function: Vec<Arc<ProfileFunction>>,
}

#[derive(Debug, Clone, Default)]
pub struct Sample {
    pub value: Vec<i64>,
    pub location: Vec<Arc<ProfileLocation>>,
}

#[derive(Debug, Clone)]
pub struct ProfileLocation {
    pub id: u64,
    pub mapping: Arc<ProfileMapping>,
    pub address: u64,
    pub is_folded: bool,
    pub line: Vec<ProfileLine>,
}

#[derive(Debug, Clone)]
pub struct ProfileLine {
    pub function: Arc<ProfileFunction>,
    pub line: i64,
}

#[derive(Debug, Clone, Default)]
pub struct ProfileMapping {
    pub id: u64,
    pub memory_start: u64,
    pub memory_limit: u64,
    pub file_offset: u64,
    pub filename: String,
    pub build_id: String,
    pub has_functions: bool,
    pub has_filenames: bool,
    pub has_line_numbers: bool,
    pub has_inline_frames: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ProfileFunction {
    pub id: u64,
    pub name: String,
    pub system_name: String,
    pub filename: String,
    pub start_line: i64,
}

/// Resolves `samples` against `symbols` into a profile.
///
/// `samples` must be co-sorted by stacktrace id ([`Samples::sort_by_stacktrace_id`]).
/// `profile.sample[i]` corresponds to input sample `i`; any id that cannot be
/// dereferenced fails the whole call with [`Error::OutOfRange`].
pub(crate) async fn resolve_profile(symbols: &Symbols, samples: &Samples) -> Result<Profile> {
    debug_assert!(samples.is_sorted(), "samples must be sorted by stacktrace id");
    let mut builder = ProfileBuilder::new(symbols, samples);
    symbols
        .resolve_stacktrace_locations(&mut builder, &samples.stacktrace_ids)
        .await?;
    Ok(builder.profile)
}

/// Sink that assembles the profile as stacktraces resolve.
///
/// The resolver fires in ascending id order, once per input id, so `cur`
/// walks the co-sorted sample vector in lockstep with the callbacks.
struct ProfileBuilder<'a> {
    symbols: &'a Symbols,
    values: &'a [u64],
    cur: usize,
    profile: Profile,
    locations: Vec<Option<Arc<ProfileLocation>>>,
    mappings: Vec<Option<Arc<ProfileMapping>>>,
    functions: Vec<Option<Arc<ProfileFunction>>>,
}

impl<'a> ProfileBuilder<'a> {
    fn new(symbols: &'a Symbols, samples: &'a Samples) -> Self {
        Self {
            symbols,
            values: &samples.values,
            cur: 0,
            profile: Profile {
                sample: vec![Sample::default(); samples.len()],
                ..Profile::default()
            },
            locations: vec![None; symbols.locations.len()],
            mappings: vec![None; symbols.mappings.len()],
            functions: vec![None; symbols.functions.len()],
        }
    }

    fn location(&mut self, id: i32) -> Result<Arc<ProfileLocation>> {
        let idx = usize::try_from(id).map_err(|_| Error::OutOfRange {
            what: "location",
            id: id as u64,
            max: self.symbols.locations.len() as u64,
        })?;
        if let Some(Some(cached)) = self.locations.get(idx) {
            return Ok(Arc::clone(cached));
        }
        let record = self.symbols.locations.get(idx).ok_or(Error::OutOfRange {
            what: "location",
            id: idx as u64,
            max: self.symbols.locations.len() as u64,
        })?;
        let mapping = self.mapping(record.mapping_id)?;
        let mut line = Vec::with_capacity(record.line.len());
        for l in &record.line {
            line.push(ProfileLine {
                function: self.function(l.function_id)?,
                line: i64::from(l.line),
            });
        }
        let location = Arc::new(ProfileLocation {
            id: record.id,
            mapping,
            address: record.address,
            is_folded: record.is_folded,
            line,
        });
        self.profile.location.push(Arc::clone(&location));
        self.locations[idx] = Some(Arc::clone(&location));
        Ok(location)
    }

    fn mapping(&mut self, id: u32) -> Result<Arc<ProfileMapping>> {
        let idx = id as usize;
        if let Some(Some(cached)) = self.mappings.get(idx) {
            return Ok(Arc::clone(cached));
        }
        let record = self.symbols.mappings.get(idx).ok_or(Error::OutOfRange {
            what: "mapping",
            id: u64::from(id),
            max: self.symbols.mappings.len() as u64,
        })?;
        let mapping = Arc::new(ProfileMapping {
            id: record.id,
            memory_start: record.memory_start,
            memory_limit: record.memory_limit,
            file_offset: record.file_offset,
            filename: self.string(record.filename)?,
            build_id: self.string(record.build_id)?,
            has_functions: record.has_functions,
            has_filenames: record.has_filenames,
            has_line_numbers: record.has_line_numbers,
            has_inline_frames: record.has_inline_frames,
        });
        self.profile.mapping.push(Arc::clone(&mapping));
        self.mappings[idx] = Some(Arc::clone(&mapping));
        Ok(mapping)
    }

    fn function(&mut self, id: u32) -> Result<Arc<ProfileFunction>> {
        let idx = id as usize;
        if let Some(Some(cached)) = self.functions.get(idx) {
            return Ok(Arc::clone(cached));
        }
        let record = self.symbols.functions.get(idx).ok_or(Error::OutOfRange {
            what: "function",
            id: u64::from(id),
            max: self.symbols.functions.len() as u64,
        })?;
        let function = Arc::new(ProfileFunction {
            id: record.id,
            name: self.string(record.name)?,
            system_name: self.string(record.system_name)?,
            filename: self.string(record.filename)?,
            start_line: i64::from(record.start_line),
        });
        self.profile.function.push(Arc::clone(&function));
        self.functions[idx] = Some(Arc::clone(&function));
        Ok(function)
    }

    fn string(&self, id: u32) -> Result<String> {
        self.symbols
            .strings
            .get(id as usize)
            .cloned()
            .ok_or(Error::OutOfRange {
                what: "string",
                id: u64::from(id),
                max: self.symbols.strings.len() as u64,
            })
    }
}

impl StacktraceSink for ProfileBuilder<'_> {
    fn insert_stacktrace(&mut self, _stacktrace_id: u32, locations: &[i32]) -> Result<()> {
        let value = *self.values.get(self.cur).ok_or(Error::OutOfRange {
            what: "sample value",
            id: self.cur as u64,
            max: self.values.len() as u64,
        })?;
        let mut sample_locations = Vec::with_capacity(locations.len());
        for &loc in locations {
            sample_locations.push(self.location(loc)?);
        }
        self.profile.sample[self.cur] = Sample {
            value: vec![value as i64],
            location: sample_locations,
        };
        self.cur += 1;
        Ok(())
    }
}
