//! Reading corpora and writing model outputs
//!
//! Every file may be gzipped (`.gz`).

use candle_core::{DType, Device, Tensor};
use flate2::read::GzDecoder;
use rayon::prelude::*;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

///
/// Open a file for reading, and return a buffered reader
/// * `input_file` - file name--either gzipped or not
pub fn open_buf_reader(input_file: &str) -> anyhow::Result<Box<dyn BufRead>> {
    let file = File::open(input_file)
        .map_err(|e| anyhow::anyhow!("failed to open {}: {}", input_file, e))?;
    match Path::new(input_file).extension().and_then(|x| x.to_str()) {
        Some("gz") => Ok(Box::new(BufReader::new(GzDecoder::new(file)))),
        _ => Ok(Box::new(BufReader::new(file))),
    }
}

///
/// Open a file for writing, and return a buffered writer
/// * `output_file` - file name--either gzipped or not
pub fn open_buf_writer(output_file: &str) -> anyhow::Result<Box<dyn Write>> {
    if output_file.eq_ignore_ascii_case("stdout") {
        return Ok(Box::new(BufWriter::new(std::io::stdout())));
    }

    mkdir_parent(output_file)?;
    let file = File::create(output_file)?;
    match Path::new(output_file).extension().and_then(|x| x.to_str()) {
        Some("gz") => Ok(Box::new(BufWriter::new(flate2::write::GzEncoder::new(
            file,
            flate2::Compression::default(),
        )))),
        _ => Ok(Box::new(BufWriter::new(file))),
    }
}

/// Create the parent directory of `file` if needed
pub fn mkdir_parent(file: &str) -> anyhow::Result<()> {
    if let Some(dir) = Path::new(file).parent() {
        if !dir.as_os_str().is_empty() {
            std::fs::create_dir_all(dir)?;
        }
    }
    Ok(())
}

fn is_comment_line(line: &str) -> bool {
    line.starts_with('#') || line.starts_with('%')
}

///
/// Read every non-empty line of the input file, e.g., a vocabulary
///
pub fn read_lines(input_file: &str) -> anyhow::Result<Vec<Box<str>>> {
    let mut lines = vec![];
    for line in open_buf_reader(input_file)?.lines() {
        let line = line?;
        let line = line.trim();
        if !line.is_empty() {
            lines.push(line.to_owned().into_boxed_str());
        }
    }
    Ok(lines)
}

///
/// Write every line into the output file
///
pub fn write_lines<T>(lines: &[T], output_file: &str) -> anyhow::Result<()>
where
    T: std::fmt::Display,
{
    let mut buf = open_buf_writer(output_file)?;
    for line in lines {
        writeln!(buf, "{}", line)?;
    }
    buf.flush()?;
    Ok(())
}

///
/// Read a dense numeric matrix, one row per line, with entries
/// separated by tabs, commas or spaces. Lines starting with `#` or
/// `%` are skipped.
///
pub fn read_dense_tensor(input_file: &str) -> anyhow::Result<Tensor> {
    let lines: Vec<String> = open_buf_reader(input_file)?
        .lines()
        .collect::<std::io::Result<Vec<_>>>()?
        .into_iter()
        .filter(|x| !x.trim().is_empty() && !is_comment_line(x))
        .collect();

    let rows = lines
        .par_iter()
        .enumerate()
        .map(|(i, line)| {
            line.split(|c: char| c == '\t' || c == ',' || c.is_whitespace())
                .filter(|x| !x.is_empty())
                .map(|x| {
                    x.parse::<f32>().map_err(|e| {
                        anyhow::anyhow!("{}: line {}: {:?}: {}", input_file, i + 1, x, e)
                    })
                })
                .collect::<anyhow::Result<Vec<f32>>>()
        })
        .collect::<anyhow::Result<Vec<_>>>()?;

    let nrows = rows.len();
    let ncols = rows.first().map(|r| r.len()).unwrap_or(0);

    if let Some((i, r)) = rows.iter().enumerate().find(|(_, r)| r.len() != ncols) {
        anyhow::bail!(
            "{}: row {} has {} columns, expected {}",
            input_file,
            i + 1,
            r.len(),
            ncols
        );
    }

    let data: Vec<f32> = rows.into_iter().flatten().collect();
    Ok(Tensor::from_vec(data, (nrows, ncols), &Device::Cpu)?)
}

///
/// Read a MatrixMarket coordinate file (rows = documents, columns =
/// vocabulary) into a dense tensor. Duplicate entries are summed.
///
pub fn read_mtx_tensor(mtx_file: &str) -> anyhow::Result<Tensor> {
    let mut lines = open_buf_reader(mtx_file)?
        .lines()
        .map_while(Result::ok)
        .filter(|x| !x.trim().is_empty() && !is_comment_line(x));

    let header = lines
        .next()
        .ok_or(anyhow::anyhow!("{}: missing MatrixMarket header", mtx_file))?;

    let dims: Vec<usize> = header
        .split_whitespace()
        .map(|x| x.parse::<usize>())
        .collect::<Result<_, _>>()?;

    if dims.len() != 3 {
        anyhow::bail!("{}: failed to parse mtx header {:?}", mtx_file, header);
    }
    let (nrow, ncol) = (dims[0], dims[1]);

    let mut data = vec![0_f32; nrow * ncol];

    for line in lines {
        let words: Vec<&str> = line.split_whitespace().collect();
        if words.len() != 3 {
            anyhow::bail!("{}: invalid triplet {:?}", mtx_file, line);
        }
        let row = words[0].parse::<usize>()?;
        let col = words[1].parse::<usize>()?;
        let val = words[2].parse::<f32>()?;

        // 1-based
        if row == 0 || col == 0 || row > nrow || col > ncol {
            anyhow::bail!(
                "{}: entry ({}, {}) out of range {} x {}",
                mtx_file,
                row,
                col,
                nrow,
                ncol
            );
        }
        data[(row - 1) * ncol + (col - 1)] += val;
    }

    Ok(Tensor::from_vec(data, (nrow, ncol), &Device::Cpu)?)
}

fn is_mtx_file(file: &str) -> bool {
    let file = file.strip_suffix(".gz").unwrap_or(file);
    file.ends_with(".mtx")
}

///
/// Read a bag-of-words corpus (documents x vocabulary) from either a
/// MatrixMarket file (`.mtx`, `.mtx.gz`) or a dense delimited file
///
pub fn read_corpus(input_file: &str) -> anyhow::Result<Tensor> {
    let x_nd = if is_mtx_file(input_file) {
        read_mtx_tensor(input_file)?
    } else {
        read_dense_tensor(input_file)?
    };

    let min_val = x_nd.min_all()?.to_scalar::<f32>()?;
    if min_val < 0.0 {
        anyhow::bail!("{}: negative word count {}", input_file, min_val);
    }
    Ok(x_nd)
}

///
/// Write a 2d tensor as tab-separated text, one row per line
///
pub fn write_tensor_tsv(tensor: &Tensor, output_file: &str) -> anyhow::Result<()> {
    let rows = tensor
        .to_device(&Device::Cpu)?
        .to_dtype(DType::F32)?
        .to_vec2::<f32>()?;

    let lines: Vec<String> = rows
        .par_iter()
        .map(|row| {
            row.iter()
                .map(|x| x.to_string())
                .collect::<Vec<_>>()
                .join("\t")
        })
        .collect();

    write_lines(&lines, output_file)
}

///
/// The `n_top` highest-weighted words of every topic, one line per
/// topic with words separated by spaces
///
/// * `beta_kv` - topic-word weights (K x V)
/// * `vocab` - words (V)
///
pub fn top_words(beta_kv: &Tensor, vocab: &[Box<str>], n_top: usize) -> anyhow::Result<Vec<String>> {
    let (_, nv) = beta_kv.dims2()?;
    if nv != vocab.len() {
        anyhow::bail!("{} words for {} dictionary columns", vocab.len(), nv);
    }

    let beta = beta_kv
        .to_device(&Device::Cpu)?
        .to_dtype(DType::F32)?
        .to_vec2::<f32>()?;

    Ok(beta
        .iter()
        .map(|row| {
            let mut order: Vec<usize> = (0..row.len()).collect();
            order.sort_by(|&a, &b| row[b].total_cmp(&row[a]));
            order
                .iter()
                .take(n_top)
                .map(|&w| vocab[w].as_ref())
                .collect::<Vec<_>>()
                .join(" ")
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mtx_and_dense_agree() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let mtx = dir.path().join("bow.mtx.gz");
        let mtx = mtx.to_str().ok_or(anyhow::anyhow!("path"))?;
        write_lines(
            &[
                "%%MatrixMarket matrix coordinate real general",
                "2 3 3",
                "1 1 2",
                "2 3 1",
                "2 3 4",
            ],
            mtx,
        )?;

        let dense = dir.path().join("bow.tsv");
        let dense = dense.to_str().ok_or(anyhow::anyhow!("path"))?;
        write_lines(&["# counts", "2\t0\t0", "0,0,5"], dense)?;

        let a = read_corpus(mtx)?.to_vec2::<f32>()?;
        let b = read_corpus(dense)?.to_vec2::<f32>()?;
        assert_eq!(a, vec![vec![2., 0., 0.], vec![0., 0., 5.]]);
        assert_eq!(a, b);
        Ok(())
    }

    #[test]
    fn ragged_rows_fail() -> anyhow::Result<()> {
        let file = tempfile::NamedTempFile::new()?;
        let path = file.path().to_str().ok_or(anyhow::anyhow!("path"))?;
        write_lines(&["1 2 3", "4 5"], path)?;
        assert!(read_dense_tensor(path).is_err());
        Ok(())
    }

    #[test]
    fn tensor_tsv_reads_back() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let out = dir.path().join("sub").join("x.tsv");
        let out = out.to_str().ok_or(anyhow::anyhow!("path"))?;

        let x = Tensor::new(&[[0.5f32, 1.25], [3., -2.]], &Device::Cpu)?;
        write_tensor_tsv(&x, out)?;
        let y = read_dense_tensor(out)?;
        assert_eq!(x.to_vec2::<f32>()?, y.to_vec2::<f32>()?);
        Ok(())
    }

    #[test]
    fn top_words_follow_weights() -> anyhow::Result<()> {
        let beta = Tensor::new(&[[0.1f32, 0.7, 0.2], [0.5, 0.1, 0.4]], &Device::Cpu)?;
        let vocab: Vec<Box<str>> = ["apple", "bread", "cider"]
            .iter()
            .map(|&w| w.into())
            .collect();
        let lines = top_words(&beta, &vocab, 2)?;
        assert_eq!(lines, vec!["bread cider", "apple cider"]);
        Ok(())
    }
}
