use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use ndarray::{Array1, Array3};
use ndarray_npy::{read_npy, NpzReader, NpzWriter, ReadNpyError, ReadNpzError, ReadableElement};
use num_complex::{Complex32, Complex64};
use tracing::{debug, info};

use crate::error::{AnalysisError, Result};
use crate::volume::{shape_of, ComplexVolume};

pub fn extension_of(path: &Path) -> String {
    path.extension()
        .and_then(|s| s.to_str())
        .map(|s| s.to_ascii_lowercase())
        .unwrap_or_default()
}

/// Source of candidate reconstructions.
pub trait VolumeLoader {
    /// Returns the complex volume and the lower-case file extension.
    fn load_volume(&self, path: &Path) -> Result<(ComplexVolume, String)>;
}

/// Reads `.npy` and `.npz` reconstructions.
#[derive(Debug, Clone, Copy, Default)]
pub struct NumpyLoader;

impl VolumeLoader for NumpyLoader {
    fn load_volume(&self, path: &Path) -> Result<(ComplexVolume, String)> {
        let extension = extension_of(path);
        let volume = match extension.as_str() {
            "npy" => read_npy_complex(path)?,
            "npz" => read_npz_complex(path, &["obj"])?,
            "h5" | "cxi" => {
                return Err(AnalysisError::UnsupportedFormat(format!(
                    "{}: HDF5 reconstructions need an HDF5-capable loader",
                    path.display()
                )))
            }
            other => {
                return Err(AnalysisError::UnsupportedFormat(format!(
                    "{}: unknown extension '{other}'",
                    path.display()
                )))
            }
        };
        debug!("loaded {} with shape {:?}", path.display(), volume.shape());
        Ok((volume, extension))
    }
}

/// `None` when the file holds another dtype; any other failure is returned as is.
fn read_npy_as<A: ReadableElement>(path: &Path) -> Result<Option<Array3<A>>> {
    match read_npy::<_, Array3<A>>(path) {
        Ok(v) => Ok(Some(v)),
        Err(ReadNpyError::WrongDescriptor(_)) => Ok(None),
        Err(err) => Err(err.into()),
    }
}

fn read_npy_complex(path: &Path) -> Result<ComplexVolume> {
    if let Some(v) = read_npy_as::<Complex64>(path)? {
        return Ok(v);
    }
    if let Some(v) = read_npy_as::<Complex32>(path)? {
        return Ok(v.mapv(|c| Complex64::new(c.re as f64, c.im as f64)));
    }
    Ok(read_npy_real(path)?.mapv(|v| Complex64::new(v, 0.0)))
}

fn read_npy_real(path: &Path) -> Result<Array3<f64>> {
    if let Some(v) = read_npy_as::<f64>(path)? {
        return Ok(v);
    }
    if let Some(v) = read_npy_as::<f32>(path)? {
        return Ok(v.mapv(f64::from));
    }
    if let Some(v) = read_npy_as::<i64>(path)? {
        return Ok(v.mapv(|x| x as f64));
    }
    if let Some(v) = read_npy_as::<i32>(path)? {
        return Ok(v.mapv(f64::from));
    }
    Ok(read_npy::<_, Array3<u8>>(path)?.mapv(f64::from))
}

fn open_npz(path: &Path) -> Result<NpzReader<BufReader<File>>> {
    Ok(NpzReader::new(BufReader::new(File::open(path)?))?)
}

/// Stored entry name matching `name`, with or without the `.npy` suffix.
fn stored_name(npz: &mut NpzReader<BufReader<File>>, name: &str) -> Result<Option<String>> {
    Ok(npz
        .names()?
        .into_iter()
        .find(|stored| stored.trim_end_matches(".npy") == name))
}

fn pick_entry(
    npz: &mut NpzReader<BufReader<File>>,
    preferred: &[&str],
) -> Result<String> {
    for name in preferred {
        if let Some(stored) = stored_name(npz, name)? {
            return Ok(stored);
        }
    }
    npz.names()?
        .into_iter()
        .next()
        .ok_or_else(|| AnalysisError::UnsupportedFormat("empty npz archive".to_string()))
}

fn by_name<A: ReadableElement>(
    npz: &mut NpzReader<BufReader<File>>,
    name: &str,
) -> Result<Option<Array3<A>>> {
    match npz.by_name(name) {
        Ok(v) => Ok(Some(v)),
        Err(ReadNpzError::Npy(ReadNpyError::WrongDescriptor(_))) => Ok(None),
        Err(err) => Err(err.into()),
    }
}

fn npz_entry_real(npz: &mut NpzReader<BufReader<File>>, name: &str) -> Result<Array3<f64>> {
    if let Some(v) = by_name::<f64>(npz, name)? {
        return Ok(v);
    }
    if let Some(v) = by_name::<f32>(npz, name)? {
        return Ok(v.mapv(f64::from));
    }
    if let Some(v) = by_name::<i64>(npz, name)? {
        return Ok(v.mapv(|x| x as f64));
    }
    if let Some(v) = by_name::<i32>(npz, name)? {
        return Ok(v.mapv(f64::from));
    }
    if let Some(v) = by_name::<u8>(npz, name)? {
        return Ok(v.mapv(f64::from));
    }
    if let Some(v) = by_name::<bool>(npz, name)? {
        return Ok(v.mapv(|b| if b { 1.0 } else { 0.0 }));
    }
    Err(AnalysisError::UnsupportedFormat(format!(
        "npz entry '{name}' is not a real 3D array"
    )))
}

fn read_npz_complex(path: &Path, preferred: &[&str]) -> Result<ComplexVolume> {
    let mut npz = open_npz(path)?;
    let name = pick_entry(&mut npz, preferred)?;
    if let Some(v) = by_name::<Complex64>(&mut npz, &name)? {
        return Ok(v);
    }
    if let Some(v) = by_name::<Complex32>(&mut npz, &name)? {
        return Ok(v.mapv(|c| Complex64::new(c.re as f64, c.im as f64)));
    }
    Ok(npz_entry_real(&mut npz, &name)?.mapv(|v| Complex64::new(v, 0.0)))
}

/// Real 3D array from `.npy`, or from `.npz` using the first of `preferred`
/// present in the archive (else its first entry).
pub fn read_real_volume(path: &Path, preferred: &[&str]) -> Result<Array3<f64>> {
    match extension_of(path).as_str() {
        "npy" => read_npy_real(path),
        "npz" => {
            let mut npz = open_npz(path)?;
            let name = pick_entry(&mut npz, preferred)?;
            npz_entry_real(&mut npz, &name)
        }
        other => Err(AnalysisError::UnsupportedFormat(format!(
            "{}: expected .npy or .npz, got '{other}'",
            path.display()
        ))),
    }
}

/// The entry `name` of an npz archive, `None` when absent.
pub fn read_npz_real(path: &Path, name: &str) -> Result<Option<Array3<f64>>> {
    let mut npz = open_npz(path)?;
    match stored_name(&mut npz, name)? {
        Some(stored) => Ok(Some(npz_entry_real(&mut npz, &stored)?)),
        None => Ok(None),
    }
}

/// Reciprocal-space sampling of the gridded diffraction data.
#[derive(Debug, Clone)]
pub struct QValues {
    pub qx: Array1<f64>,
    pub qy: Array1<f64>,
    pub qz: Array1<f64>,
}

/// Loads `qx`, `qy`, `qz` from an npz file saved during preprocessing.
pub fn load_q_values(path: Option<&Path>) -> Result<QValues> {
    let path = match path {
        Some(p) if p.is_file() => p,
        Some(p) => {
            return Err(AnalysisError::MissingGeometryFile(format!(
                "q values file {} does not exist",
                p.display()
            )))
        }
        None => {
            return Err(AnalysisError::MissingGeometryFile(
                "no q values file configured, voxel sizes cannot be derived".to_string(),
            ))
        }
    };
    let mut npz = open_npz(path)?;
    let mut axis = |name: &str| -> Result<Array1<f64>> {
        let stored = stored_name(&mut npz, name)?.ok_or_else(|| {
            AnalysisError::MissingGeometryFile(format!("{} has no '{name}'", path.display()))
        })?;
        Ok(npz.by_name(&stored)?)
    };
    Ok(QValues {
        qx: axis("qx")?,
        qy: axis("qy")?,
        qz: axis("qz")?,
    })
}

/// Picks the reconstruction files to analyse for one scan.
pub trait PathResolver {
    fn resolve(&self, known: Option<&[PathBuf]>) -> Result<Vec<PathBuf>>;
}

/// Non-interactive resolver: configured paths, else a fixed fallback list.
#[derive(Debug, Clone, Default)]
pub struct StaticPaths {
    pub fallback: Vec<PathBuf>,
}

impl PathResolver for StaticPaths {
    fn resolve(&self, known: Option<&[PathBuf]>) -> Result<Vec<PathBuf>> {
        let paths = match known {
            Some(paths) if !paths.is_empty() => paths.to_vec(),
            _ => self.fallback.clone(),
        };
        if paths.is_empty() {
            return Err(AnalysisError::precondition(
                "no reconstruction file to analyse",
            ));
        }
        Ok(paths)
    }
}

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    Ok(())
}

/// Compressed npz with `amp` and `phase`.
pub fn save_modulus_phase(path: &Path, modulus: &Array3<f64>, phase: &Array3<f64>) -> Result<()> {
    ensure_parent(path)?;
    let mut npz = NpzWriter::new_compressed(File::create(path)?);
    npz.add_array("amp", modulus)?;
    npz.add_array("phase", phase)?;
    npz.finish()?;
    info!("saved modulus and phase to {}", path.display());
    Ok(())
}

/// Compressed npz with the binary support `obj` (modulus above 10% of its max).
pub fn save_support(path: &Path, modulus: &Array3<f64>) -> Result<()> {
    ensure_parent(path)?;
    let max = modulus.iter().cloned().fold(0.0_f64, f64::max);
    let support: Array3<u8> = if max > 0.0 {
        modulus.mapv(|m| u8::from(m / max > 0.1))
    } else {
        Array3::zeros(modulus.dim())
    };
    let mut npz = NpzWriter::new_compressed(File::create(path)?);
    npz.add_array("obj", &support)?;
    npz.finish()?;
    info!("saved support to {}", path.display());
    Ok(())
}

/// Compressed npz with the complex volume under `data`.
pub fn save_complex(path: &Path, data: &ComplexVolume) -> Result<()> {
    ensure_parent(path)?;
    let mut npz = NpzWriter::new_compressed(File::create(path)?);
    npz.add_array("data", data)?;
    npz.finish()?;
    info!("saved complex volume to {}", path.display());
    Ok(())
}

fn write_data_array<W: Write>(out: &mut W, name: &str, values: &Array3<f64>) -> Result<()> {
    writeln!(
        out,
        "        <DataArray type=\"Float64\" Name=\"{name}\" format=\"ascii\">"
    )?;
    for (i, v) in values.iter().enumerate() {
        if i % 8 == 0 {
            write!(out, "          ")?;
        }
        write!(out, "{v:.6e}")?;
        if i % 8 == 7 {
            writeln!(out)?;
        } else {
            write!(out, " ")?;
        }
    }
    if values.len() % 8 != 0 {
        writeln!(out)?;
    }
    writeln!(out, "        </DataArray>")?;
    Ok(())
}

/// VTK XML ImageData with point arrays `amp` (normalized, below 0.01 zeroed)
/// and `phase`. `voxel_sizes` are in array order (z, y, x), nm.
pub fn save_to_vti(
    path: &Path,
    modulus: &Array3<f64>,
    phase: &Array3<f64>,
    voxel_sizes: [f64; 3],
) -> Result<()> {
    if modulus.dim() != phase.dim() {
        return Err(AnalysisError::invalid(
            "amplitude and phase must share one shape",
        ));
    }
    if voxel_sizes.iter().any(|&v| !(v > 0.0)) {
        return Err(AnalysisError::invalid(format!(
            "voxel sizes must be positive, got {voxel_sizes:?}"
        )));
    }
    ensure_parent(path)?;
    let [nz, ny, nx] = shape_of(modulus);
    let max = modulus.iter().cloned().fold(0.0_f64, f64::max);
    let amp = modulus.mapv(|m| {
        let a = if max > 0.0 { m / max } else { 0.0 };
        if a < 0.01 {
            0.0
        } else {
            a
        }
    });
    let extent = format!("0 {} 0 {} 0 {}", nx.saturating_sub(1), ny.saturating_sub(1), nz.saturating_sub(1));

    let mut out = BufWriter::new(File::create(path)?);
    writeln!(out, "<?xml version=\"1.0\"?>")?;
    writeln!(
        out,
        "<VTKFile type=\"ImageData\" version=\"0.1\" byte_order=\"LittleEndian\">"
    )?;
    writeln!(
        out,
        "  <ImageData WholeExtent=\"{extent}\" Origin=\"0 0 0\" Spacing=\"{} {} {}\">",
        voxel_sizes[2], voxel_sizes[1], voxel_sizes[0]
    )?;
    writeln!(out, "    <Piece Extent=\"{extent}\">")?;
    writeln!(out, "      <PointData Scalars=\"amp\">")?;
    write_data_array(&mut out, "amp", &amp)?;
    write_data_array(&mut out, "phase", phase)?;
    writeln!(out, "      </PointData>")?;
    writeln!(out, "      <CellData/>")?;
    writeln!(out, "    </Piece>")?;
    writeln!(out, "  </ImageData>")?;
    writeln!(out, "</VTKFile>")?;
    out.flush()?;
    info!("saved VTK image to {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{
        load_q_values, read_npz_real, read_real_volume, save_modulus_phase, save_support,
        save_to_vti, NumpyLoader, PathResolver, StaticPaths, VolumeLoader,
    };
    use crate::error::AnalysisError;
    use ndarray::{Array1, Array2, Array3};
    use ndarray_npy::{write_npy, NpzWriter, ReadNpyError, ReadNpzError};
    use num_complex::Complex64;
    use std::fs::File;
    use std::path::PathBuf;

    #[test]
    fn loads_complex_npy_and_real_npz() {
        let dir = tempfile::tempdir().unwrap();
        let npy = dir.path().join("rec.npy");
        let data = Array3::from_shape_fn((2, 3, 4), |(z, y, x)| {
            Complex64::new(z as f64, (y * x) as f64)
        });
        write_npy(&npy, &data).unwrap();
        let (loaded, ext) = NumpyLoader.load_volume(&npy).unwrap();
        assert_eq!(ext, "npy");
        assert_eq!(loaded, data);

        let npz = dir.path().join("rec.npz");
        let mut writer = NpzWriter::new(File::create(&npz).unwrap());
        writer.add_array("other", &Array3::<f64>::zeros((1, 1, 1))).unwrap();
        writer.add_array("obj", &Array3::<f64>::ones((2, 2, 2))).unwrap();
        writer.finish().unwrap();
        let (loaded, ext) = NumpyLoader.load_volume(&npz).unwrap();
        assert_eq!(ext, "npz");
        assert_eq!(loaded.dim(), (2, 2, 2));
        assert_eq!(loaded[[1, 1, 1]], Complex64::new(1.0, 0.0));
    }

    #[test]
    fn wrong_dimensionality_is_reported_not_masked_by_dtype_retries() {
        let dir = tempfile::tempdir().unwrap();
        let flat = dir.path().join("flat.npy");
        write_npy(&flat, &Array2::<f64>::zeros((3, 4))).unwrap();
        let err = NumpyLoader.load_volume(&flat).unwrap_err();
        assert!(
            matches!(err, AnalysisError::ReadNpy(ReadNpyError::WrongNdim(..))),
            "{err}"
        );

        let archive = dir.path().join("flat.npz");
        let mut writer = NpzWriter::new(File::create(&archive).unwrap());
        writer.add_array("obj", &Array2::<f64>::zeros((3, 4))).unwrap();
        writer.finish().unwrap();
        let err = NumpyLoader.load_volume(&archive).unwrap_err();
        assert!(
            matches!(err, AnalysisError::ReadNpz(ReadNpzError::Npy(ReadNpyError::WrongNdim(..)))),
            "{err}"
        );

        let missing = NumpyLoader.load_volume(&dir.path().join("absent.npy")).unwrap_err();
        assert!(matches!(missing, AnalysisError::ReadNpy(ReadNpyError::Io(_))), "{missing}");
    }

    #[test]
    fn hdf5_is_reported_as_unsupported() {
        let err = NumpyLoader
            .load_volume(&PathBuf::from("modes.h5"))
            .unwrap_err();
        assert!(matches!(err, AnalysisError::UnsupportedFormat(_)));
    }

    #[test]
    fn modulus_phase_and_support_archives() {
        let dir = tempfile::tempdir().unwrap();
        let modulus = Array3::from_shape_fn((3, 3, 3), |(z, _, _)| z as f64);
        let phase = Array3::from_elem((3, 3, 3), 0.5);
        let path = dir.path().join("out/amp_phase.npz");
        save_modulus_phase(&path, &modulus, &phase).unwrap();
        assert_eq!(read_npz_real(&path, "amp").unwrap().unwrap(), modulus);
        assert_eq!(read_real_volume(&path, &["phase"]).unwrap(), phase);
        assert!(read_npz_real(&path, "missing").unwrap().is_none());

        let support_path = dir.path().join("support.npz");
        save_support(&support_path, &modulus).unwrap();
        let support = read_npz_real(&support_path, "obj").unwrap().unwrap();
        assert_eq!(support.sum(), 18.0);
    }

    #[test]
    fn vti_has_image_data_with_two_arrays() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("obj.vti");
        let modulus = Array3::from_shape_fn((2, 3, 4), |(z, y, x)| (z + y + x) as f64);
        let phase = Array3::from_elem((2, 3, 4), -0.25);
        save_to_vti(&path, &modulus, &phase, [5.0, 6.0, 7.0]).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        let doc = roxmltree::Document::parse(&text).unwrap();
        let image = doc
            .descendants()
            .find(|n| n.has_tag_name("ImageData"))
            .unwrap();
        assert_eq!(image.attribute("WholeExtent"), Some("0 3 0 2 0 1"));
        assert_eq!(image.attribute("Spacing"), Some("7 6 5"));
        let arrays: Vec<_> = doc
            .descendants()
            .filter(|n| n.has_tag_name("DataArray"))
            .collect();
        assert_eq!(arrays.len(), 2);
        assert_eq!(arrays[0].attribute("Name"), Some("amp"));
        let amp: Vec<f64> = arrays[0]
            .text()
            .unwrap()
            .split_whitespace()
            .map(|v| v.parse().unwrap())
            .collect();
        assert_eq!(amp.len(), 24);
        assert_eq!(amp[0], 0.0);
        assert!((amp[23] - 1.0).abs() < 1e-9);
        assert!(save_to_vti(&path, &modulus, &phase, [0.0, 1.0, 1.0]).is_err());
    }

    #[test]
    fn q_values_require_an_existing_file() {
        assert!(matches!(
            load_q_values(None),
            Err(AnalysisError::MissingGeometryFile(_))
        ));
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("q.npz");
        assert!(matches!(
            load_q_values(Some(missing.as_path())),
            Err(AnalysisError::MissingGeometryFile(_))
        ));
        let mut writer = NpzWriter::new(File::create(&missing).unwrap());
        writer.add_array("qx", &Array1::linspace(0.0, 1.0, 5)).unwrap();
        writer.add_array("qy", &Array1::linspace(0.0, 2.0, 5)).unwrap();
        writer.add_array("qz", &Array1::linspace(0.0, 3.0, 5)).unwrap();
        writer.finish().unwrap();
        let q = load_q_values(Some(missing.as_path())).unwrap();
        assert_eq!(q.qz.len(), 5);
        assert!((q.qy[4] - 2.0).abs() < 1e-12);
    }

    #[test]
    fn static_paths_prefer_configured_files() {
        let resolver = StaticPaths {
            fallback: vec![PathBuf::from("b.npz")],
        };
        let known = [PathBuf::from("a.npz")];
        assert_eq!(resolver.resolve(Some(&known[..])).unwrap(), known.to_vec());
        assert_eq!(resolver.resolve(None).unwrap(), vec![PathBuf::from("b.npz")]);
        assert!(StaticPaths::default()
            .resolve(Some(&[] as &[PathBuf]))
            .is_err());
    }
}
