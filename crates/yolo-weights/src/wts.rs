//! The `.wts` weight file format.
//!
//! UTF-8 text. The first line holds the number of entries; every following
//! line is `<name> <count> <hex> <hex> ...`, one hex word per value holding
//! the IEEE-754 bit pattern of an f32.

use std::fs;
use std::io::{self, Write};
use std::path::Path;

use crate::{LoadError, NamedWeightMap, WeightTensor};

/// Loads and stores [`NamedWeightMap`]s on disk.
#[derive(Debug)]
pub struct WeightRepository;

impl WeightRepository {
    /// Read and parse a `.wts` file.
    pub fn load(path: impl AsRef<Path>) -> Result<NamedWeightMap, LoadError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| LoadError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let map = parse_wts(&text)?;
        log::info!(
            "loaded {} weight tensors ({} values) from {}",
            map.len(),
            map.total_values(),
            path.display()
        );
        Ok(map)
    }

    /// Write a map as a `.wts` file.
    pub fn save(map: &NamedWeightMap, path: impl AsRef<Path>) -> Result<(), LoadError> {
        let path = path.as_ref();
        let io_err = |source| LoadError::Io {
            path: path.to_path_buf(),
            source,
        };
        let file = fs::File::create(path).map_err(io_err)?;
        let mut writer = io::BufWriter::new(file);
        write_wts(map, &mut writer).map_err(io_err)?;
        writer.flush().map_err(io_err)
    }
}

/// Parse `.wts` text into a weight map.
pub fn parse_wts(text: &str) -> Result<NamedWeightMap, LoadError> {
    let mut lines = text
        .lines()
        .enumerate()
        .map(|(i, l)| (i + 1, l.trim()))
        .filter(|(_, l)| !l.is_empty());

    let Some((header_line, header)) = lines.next() else {
        return Err(LoadError::Malformed {
            line: 1,
            reason: "empty file".into(),
        });
    };
    let declared: usize = header.parse().map_err(|_| LoadError::Malformed {
        line: header_line,
        reason: format!("expected entry count, found '{header}'"),
    })?;

    let mut map = NamedWeightMap::new();
    let mut found = 0usize;
    for (line, content) in lines {
        found += 1;
        let (name, tensor) = parse_entry(line, content)?;
        if map.contains(name) {
            return Err(LoadError::DuplicateKey {
                name: name.into(),
                line,
            });
        }
        map.insert(name, tensor);
    }

    if found != declared {
        return Err(LoadError::EntryCount { declared, found });
    }
    Ok(map)
}

fn parse_entry(line: usize, content: &str) -> Result<(&str, WeightTensor), LoadError> {
    let mut tokens = content.split_whitespace();
    let malformed = |reason: String| LoadError::Malformed { line, reason };

    let name = tokens
        .next()
        .ok_or_else(|| malformed("missing weight name".into()))?;
    let count_token = tokens
        .next()
        .ok_or_else(|| malformed(format!("missing value count for '{name}'")))?;
    let declared: usize = count_token
        .parse()
        .map_err(|_| malformed(format!("invalid value count '{count_token}' for '{name}'")))?;

    let mut values = Vec::with_capacity(declared.min(1 << 24));
    for token in tokens {
        let bits = u32::from_str_radix(token, 16)
            .map_err(|_| malformed(format!("invalid hex word '{token}' in '{name}'")))?;
        values.push(f32::from_bits(bits));
    }

    if values.len() != declared {
        return Err(LoadError::CountMismatch {
            name: name.into(),
            declared,
            found: values.len(),
        });
    }
    Ok((name, WeightTensor::new(values)))
}

/// Serialize a weight map in `.wts` format, entries sorted by name.
pub fn write_wts(map: &NamedWeightMap, out: &mut impl Write) -> io::Result<()> {
    writeln!(out, "{}", map.len())?;
    for name in map.names() {
        let Some(tensor) = map.get(name) else {
            continue;
        };
        write!(out, "{name} {}", tensor.len())?;
        for v in tensor.values() {
            write!(out, " {:08x}", v.to_bits())?;
        }
        writeln!(out)?;
    }
    Ok(())
}
