use crate::error::{PewrError, Result};
use crate::io::{GuessType, PixelType};
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// A prior estimate to resume from: a space-domain complex file and the
/// iteration it was emitted at.
#[derive(Clone, Debug)]
pub struct GuessSpec {
    pub path: PathBuf,
    pub start_iter: usize,
    pub ty: GuessType,
}

/// Fully validated reconstruction setup, as read from the command file.
///
/// Commands are whitespace-tokenized key/value pairs. Several commands depend
/// on earlier ones (`nplanes` on `size` and `padding`, `planes` on `nplanes`
/// and `type`, defocus values on `nplanes`, `guess` on `guesstype`); using
/// one before its prerequisite is an error, as is any unknown command.
#[derive(Clone, Debug)]
pub struct Config {
    pub size: usize,
    pub padding: usize,
    pub nplanes: usize,
    pub qmax: f64,
    pub lambda: f64,
    pub psize: f64,
    pub iters: usize,
    pub pixel_type: PixelType,
    pub planes: Vec<PathBuf>,
    pub fvals: Vec<f64>,
    pub guess: Option<GuessSpec>,
    pub output: String,
    pub outputfreq: usize,
    pub outputgeom: f64,
    pub outputlast: usize,
    pub threads: Option<usize>,
    pub verbose: bool,
}

struct Tokens<'a> {
    iter: std::str::SplitWhitespace<'a>,
}

impl<'a> Tokens<'a> {
    fn next(&mut self, key: &str) -> Result<&'a str> {
        self.iter
            .next()
            .ok_or_else(|| PewrError::Config(format!("{key}: missing value")))
    }

    fn parse<T: FromStr>(&mut self, key: &str) -> Result<T> {
        let token = self.next(key)?;
        token
            .parse()
            .map_err(|_| PewrError::Config(format!("{key}: cannot parse '{token}'")))
    }
}

fn required<T>(value: Option<T>, key: &str) -> Result<T> {
    value.ok_or_else(|| PewrError::Config(format!("{key} must be set in the config file")))
}

// FFT lengths built purely from small factors run much faster.
fn has_large_prime_factor(mut n: usize) -> bool {
    for p in [2, 3, 5, 7, 11] {
        while n % p == 0 {
            n /= p;
        }
    }
    n > 1
}

impl Config {
    pub fn from_file(path: &Path) -> Result<Config> {
        let text = fs::read_to_string(path).map_err(|e| PewrError::io(path, e))?;
        Config::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Config> {
        let mut tokens = Tokens {
            iter: text.split_whitespace(),
        };

        let mut size = None;
        let mut padding = None;
        let mut nplanes = None;
        let mut qmax = None;
        let mut lambda = None;
        let mut psize = None;
        let mut iters = None;
        let mut pixel_type = None;
        let mut planes: Option<Vec<PathBuf>> = None;
        let mut fvals: Option<Vec<f64>> = None;
        let mut guess_type = GuessType::Double;
        let mut guess = None;
        let mut output = None;
        let mut outputfreq = 0;
        let mut outputgeom = 0.0;
        let mut outputlast = 1;
        let mut threads = None;
        let mut verbose = false;

        while let Some(cmd) = tokens.iter.next() {
            match cmd {
                "size" => size = Some(tokens.parse("size")?),
                "padding" => padding = Some(tokens.parse("padding")?),
                "nplanes" => {
                    if size.is_none() || padding.is_none() {
                        return Err(PewrError::Config(
                            "size and padding must be set before nplanes".into(),
                        ));
                    }
                    nplanes = Some(tokens.parse::<usize>("nplanes")?);
                }
                "qmax" => qmax = Some(tokens.parse("qmax")?),
                "lambda" => lambda = Some(tokens.parse("lambda")?),
                "psize" => psize = Some(tokens.parse("psize")?),
                "iters" => iters = Some(tokens.parse("iters")?),
                "type" => {
                    let token = tokens.next("type")?;
                    pixel_type = Some(PixelType::from_str(token).map_err(PewrError::Config)?);
                }
                "planes" => {
                    let n = required(nplanes, "nplanes (before planes)")?;
                    if pixel_type.is_none() {
                        return Err(PewrError::Config("type must be set before planes".into()));
                    }
                    let mut names = Vec::with_capacity(n);
                    for _ in 0..n {
                        names.push(PathBuf::from(tokens.next("planes")?));
                    }
                    planes = Some(names);
                }
                "fvals" => {
                    let n = required(nplanes, "nplanes (before fvals)")?;
                    let mut vals = Vec::with_capacity(n);
                    for _ in 0..n {
                        vals.push(tokens.parse("fvals")?);
                    }
                    fvals = Some(vals);
                }
                "frange" => {
                    let n = required(nplanes, "nplanes (before frange)")?;
                    let start: f64 = tokens.parse("frange")?;
                    let incr: f64 = tokens.parse("frange")?;
                    fvals = Some((0..n).map(|i| start + incr * i as f64).collect());
                }
                "guesstype" => {
                    if guess.is_some() {
                        return Err(PewrError::Config("guesstype must come before guess".into()));
                    }
                    let token = tokens.next("guesstype")?;
                    guess_type = GuessType::from_str(token).map_err(PewrError::Config)?;
                }
                "guess" => {
                    let path = PathBuf::from(tokens.next("guess")?);
                    let start_iter = tokens.parse("guess")?;
                    guess = Some(GuessSpec {
                        path,
                        start_iter,
                        ty: guess_type,
                    });
                }
                "output" => output = Some(tokens.next("output")?.to_string()),
                "outputfreq" => outputfreq = tokens.parse("outputfreq")?,
                "outputgeom" => outputgeom = tokens.parse("outputgeom")?,
                "outputlast" => outputlast = tokens.parse("outputlast")?,
                "threads" => threads = Some(tokens.parse("threads")?),
                "verbose" => verbose = true,
                other => {
                    return Err(PewrError::Config(format!("unknown command {other}")));
                }
            }
        }

        let config = Config {
            size: required(size, "size")?,
            padding: required(padding, "padding")?,
            nplanes: required(nplanes, "nplanes")?,
            qmax: required(qmax, "qmax")?,
            lambda: required(lambda, "lambda")?,
            psize: required(psize, "psize")?,
            iters: required(iters, "iters")?,
            pixel_type: required(pixel_type, "type")?,
            planes: required(planes, "planes")?,
            fvals: required(fvals, "fvals or frange")?,
            guess,
            output: required(output, "output")?,
            outputfreq,
            outputgeom,
            outputlast,
            threads,
            verbose,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        for (value, key) in [
            (self.size, "size"),
            (self.padding, "padding"),
            (self.nplanes, "nplanes"),
            (self.iters, "iters"),
        ] {
            if value == 0 {
                return Err(PewrError::Config(format!("{key} must be nonzero")));
            }
        }
        for (value, key) in [
            (self.qmax, "qmax"),
            (self.lambda, "lambda"),
            (self.psize, "psize"),
        ] {
            if value == 0.0 {
                return Err(PewrError::Config(format!("{key} must be nonzero")));
            }
        }
        if self.padding < self.size {
            return Err(PewrError::Config(format!(
                "padding {} is smaller than size {}",
                self.padding, self.size
            )));
        }
        if self.outputgeom != 0.0 && self.outputgeom <= 1.0 {
            return Err(PewrError::Config(
                "outputgeom must be 0 or greater than 1".into(),
            ));
        }
        if self.outputlast == 0 {
            return Err(PewrError::Config("outputlast must be at least 1".into()));
        }
        if has_large_prime_factor(self.padding) {
            tracing::warn!(
                "padding {} has a prime factor above 11; transforms will be slow",
                self.padding
            );
        }
        Ok(())
    }
}
