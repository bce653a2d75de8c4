use crate::error::{PewrError, Result};
use byteorder::{NativeEndian, ReadBytesExt, WriteBytesExt};
use ndarray::{Array2, ArrayView2};
use num_complex::Complex;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;
use std::str::FromStr;

/// Element type of a raw intensity file.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PixelType {
    Uint8,
    Int8,
    Uint16,
    Int16,
    Uint32,
    Int32,
    Float,
    Double,
}

impl FromStr for PixelType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, String> {
        Ok(match s {
            "uint8" => PixelType::Uint8,
            "int8" => PixelType::Int8,
            "uint16" => PixelType::Uint16,
            "int16" => PixelType::Int16,
            "uint32" => PixelType::Uint32,
            "int32" => PixelType::Int32,
            "float" => PixelType::Float,
            "double" => PixelType::Double,
            other => return Err(format!("unknown type {other}")),
        })
    }
}

/// Element width of a prior-guess file. Output files are written as `f64`
/// pairs, so a resumed run reads them back with [`GuessType::Double`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GuessType {
    Float,
    Double,
}

impl FromStr for GuessType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, String> {
        Ok(match s {
            "float" => GuessType::Float,
            "double" => GuessType::Double,
            other => return Err(format!("unknown guesstype {other}, choose double or float")),
        })
    }
}

fn read_sample<R: Read>(reader: &mut R, ty: PixelType) -> std::io::Result<f64> {
    Ok(match ty {
        PixelType::Uint8 => reader.read_u8()? as f64,
        PixelType::Int8 => reader.read_i8()? as f64,
        PixelType::Uint16 => reader.read_u16::<NativeEndian>()? as f64,
        PixelType::Int16 => reader.read_i16::<NativeEndian>()? as f64,
        PixelType::Uint32 => reader.read_u32::<NativeEndian>()? as f64,
        PixelType::Int32 => reader.read_i32::<NativeEndian>()? as f64,
        PixelType::Float => reader.read_f32::<NativeEndian>()? as f64,
        PixelType::Double => reader.read_f64::<NativeEndian>()?,
    })
}

pub(crate) fn read_intensity_from<R: Read>(
    reader: &mut R,
    ty: PixelType,
    size: usize,
) -> std::io::Result<Array2<f64>> {
    let mut image = Array2::zeros((size, size));
    for x in 0..size {
        for y in 0..size {
            image[[x, y]] = read_sample(reader, ty)?;
        }
    }
    Ok(image)
}

/// Decode a headerless row-major `size x size` intensity image.
pub fn read_intensity(path: &Path, ty: PixelType, size: usize) -> Result<Array2<f64>> {
    let file = File::open(path).map_err(|e| PewrError::io(path, e))?;
    let mut reader = BufReader::new(file);
    read_intensity_from(&mut reader, ty, size).map_err(|e| PewrError::io(path, e))
}

pub(crate) fn read_guess_from<R: Read>(
    reader: &mut R,
    ty: GuessType,
    padding: usize,
) -> std::io::Result<Array2<Complex<f64>>> {
    let mut wave = Array2::zeros((padding, padding));
    for x in 0..padding {
        for y in 0..padding {
            wave[[x, y]] = match ty {
                GuessType::Float => {
                    let re = reader.read_f32::<NativeEndian>()? as f64;
                    let im = reader.read_f32::<NativeEndian>()? as f64;
                    Complex::new(re, im)
                }
                GuessType::Double => {
                    let re = reader.read_f64::<NativeEndian>()?;
                    let im = reader.read_f64::<NativeEndian>()?;
                    Complex::new(re, im)
                }
            };
        }
    }
    Ok(wave)
}

/// Read a space-domain `padding x padding` complex guess.
pub fn read_guess(path: &Path, ty: GuessType, padding: usize) -> Result<Array2<Complex<f64>>> {
    let file = File::open(path).map_err(|e| PewrError::io(path, e))?;
    let mut reader = BufReader::new(file);
    read_guess_from(&mut reader, ty, padding).map_err(|e| PewrError::io(path, e))
}

pub(crate) fn write_exit_wave_to<W: Write>(
    writer: &mut W,
    wave: ArrayView2<'_, Complex<f64>>,
) -> std::io::Result<()> {
    for w in wave.iter() {
        writer.write_f64::<NativeEndian>(w.re)?;
        writer.write_f64::<NativeEndian>(w.im)?;
    }
    Ok(())
}

/// Write the full padded estimate as headerless native `f64` pairs, real
/// part first. Rows are the outer index.
pub fn write_exit_wave(path: &Path, wave: ArrayView2<'_, Complex<f64>>) -> Result<()> {
    let file = File::create(path).map_err(|e| PewrError::io(path, e))?;
    let mut writer = BufWriter::new(file);
    write_exit_wave_to(&mut writer, wave).map_err(|e| PewrError::io(path, e))?;
    writer.flush().map_err(|e| PewrError::io(path, e))
}
