//! Instruction program generator.
//!
//! Turns command-line operation tuples into a binary program. Operand slots
//! are named: the first time a name appears its data is created (random
//! inputs, reference results for result slots) and later tuples using the
//! same name refer to the same arena handle.

use anyhow::{Context, Result, ensure};
use std::collections::HashMap;
use std::io::{self, Write};
use std::path::Path;
use xfb_common::isa::Opcode;
use xfb_core::format::FormatParams;
use xfb_core::genbin::{GenBin, Operand};
use xfb_core::reference::b1_golden;
use xfb_io::binfile;

/// Tokens per operation tuple.
pub const TUPLE_TOKENS: usize = 8;

const NULL_TOKEN: &str = "null";

/// One `opName n alpha handleX handleY handleResX handleResY resScalar`
/// tuple.
#[derive(Debug, Clone, PartialEq)]
pub struct OpTuple {
    pub op: String,
    pub n: u32,
    pub alpha: f32,
    /// Slot names in `x, y, xRes, yRes` order; `None` for `null`.
    pub slots: [Option<String>; 4],
    pub res_scalar: f32,
}

/// Splits trailing arguments into tuples.
pub fn parse_tuples(tokens: &[String]) -> Result<Vec<OpTuple>> {
    ensure!(
        !tokens.is_empty() && tokens.len() % TUPLE_TOKENS == 0,
        "expected groups of {TUPLE_TOKENS} tokens (opName n alpha handleX handleY handleResX handleResY resScalar), got {}",
        tokens.len()
    );
    tokens
        .chunks_exact(TUPLE_TOKENS)
        .enumerate()
        .map(|(i, t)| {
            let slot = |s: &String| (!s.eq_ignore_ascii_case(NULL_TOKEN)).then(|| s.clone());
            Ok(OpTuple {
                op: t[0].clone(),
                n: t[1].parse().with_context(|| format!("tuple {i}: invalid n {:?}", t[1]))?,
                alpha: t[2]
                    .parse()
                    .with_context(|| format!("tuple {i}: invalid alpha {:?}", t[2]))?,
                slots: [slot(&t[3]), slot(&t[4]), slot(&t[5]), slot(&t[6])],
                res_scalar: t[7]
                    .parse()
                    .with_context(|| format!("tuple {i}: invalid resScalar {:?}", t[7]))?,
            })
        })
        .collect()
}

/// Deterministic xorshift source for operand data.
pub struct XorShift(u64);

impl XorShift {
    pub fn new(seed: u64) -> Self {
        Self(seed.max(1))
    }

    /// Next value in `[-1, 1)`.
    pub fn next_f32(&mut self) -> f32 {
        let mut s = self.0;
        s ^= s >> 12;
        s ^= s << 25;
        s ^= s >> 27;
        self.0 = s;
        let unit = (s.wrapping_mul(0x2545F4914F6CDD1D) >> 40) as f32 / (1u64 << 24) as f32;
        unit * 2.0 - 1.0
    }

    pub fn vector(&mut self, n: usize) -> Vec<f32> {
        (0..n).map(|_| self.next_f32()).collect()
    }
}

struct Named {
    handle: u32,
    data: Vec<f32>,
}

enum Source {
    Absent,
    Existing(u32, Vec<f32>),
    Fresh(Vec<f32>),
}

impl Source {
    fn data(&self) -> Option<&[f32]> {
        match self {
            Self::Absent => None,
            Self::Existing(_, d) | Self::Fresh(d) => Some(d.as_slice()),
        }
    }

    fn operand(&self) -> Operand<'_> {
        match self {
            Self::Absent => Operand::Absent,
            Self::Existing(h, _) => Operand::Handle(*h),
            Self::Fresh(d) => Operand::Data(d.as_slice()),
        }
    }
}

/// Encodes `tuples` into a program.
///
/// # Arguments
///
/// * `tuples` - Parsed operation tuples, in program order
/// * `params` - Memory-word geometry of the target
/// * `seed` - Seed for input operand data
pub fn build_program(tuples: &[OpTuple], params: FormatParams, seed: u64) -> Result<GenBin> {
    let mut gen_bin = GenBin::new(params);
    let mut rng = XorShift::new(seed);
    let mut named: HashMap<String, Named> = HashMap::new();

    for (i, t) in tuples.iter().enumerate() {
        let op = Opcode::from_mnemonic(&t.op).with_context(|| format!("tuple {i}: unknown operation {}", t.op))?;
        let n = t.n as usize;
        let lookup = |name: &Option<String>| {
            name.as_ref()
                .and_then(|k| named.get(k))
                .map(|e| Source::Existing(e.handle, e.data.clone()))
        };

        let [x_name, y_name, xr_name, yr_name] = &t.slots;
        let x = lookup(x_name).unwrap_or_else(|| match x_name {
            Some(_) => Source::Fresh(rng.vector(n)),
            None => Source::Absent,
        });
        let y = lookup(y_name).unwrap_or_else(|| match y_name {
            Some(_) => Source::Fresh(rng.vector(n)),
            None => Source::Absent,
        });
        let golden = b1_golden(op, t.alpha, x.data(), y.data());
        let result = |name: &Option<String>, want: Option<Vec<f32>>| {
            lookup(name).unwrap_or_else(|| match name {
                Some(_) => Source::Fresh(want.unwrap_or_else(|| vec![0.0; n])),
                None => Source::Absent,
            })
        };
        let x_res = result(xr_name, golden.x_res);
        let y_res = result(yr_name, golden.y_res);

        let handles = gen_bin
            .add_b1_instr(
                &t.op,
                t.n,
                t.alpha,
                x.operand(),
                y.operand(),
                x_res.operand(),
                y_res.operand(),
                t.res_scalar,
            )
            .with_context(|| format!("tuple {i}: cannot encode {}", t.op))?;

        let assigned = [handles.x, handles.y, handles.x_res, handles.y_res];
        for ((name, source), handle) in t.slots.iter().zip([x, y, x_res, y_res]).zip(assigned) {
            if let (Some(name), Source::Fresh(data), Some(handle)) = (name, source, handle) {
                named.entry(name.clone()).or_insert(Named { handle, data });
            }
        }
    }
    Ok(gen_bin)
}

/// `write`: encodes the tuples and writes the program file.
pub fn write_program(path: &Path, tokens: &[String]) -> Result<()> {
    let tuples = parse_tuples(tokens)?;
    let gen_bin = build_program(&tuples, FormatParams::default(), 12345)?;
    let program = gen_bin.into_program();
    binfile::write_bin_file(path, &program).with_context(|| format!("failed to write {}", path.display()))?;
    println!("Wrote {} instructions to {}", program.instrs.len(), path.display());
    Ok(())
}

fn summary(values: &Option<Vec<f32>>) -> String {
    match values {
        None => NULL_TOKEN.to_string(),
        Some(v) => {
            let head: Vec<String> = v.iter().take(4).map(|x| format!("{x:.4}")).collect();
            let more = if v.len() > 4 { ", ..." } else { "" };
            format!("[{}{more}]", head.join(", "))
        }
    }
}

/// `read`: decodes every instruction and its operands.
pub fn read_program(path: &Path) -> Result<()> {
    let gen_bin = binfile::read_from_bin_file(path, &FormatParams::default())
        .with_context(|| format!("failed to read {}", path.display()))?;
    let decoded = gen_bin.decode_all()?;
    println!("{}: {} instructions", path.display(), decoded.len());
    for (i, d) in decoded.iter().enumerate() {
        println!(
            "[{i:4}] {} n={} alpha={} x={} y={} xRes={} yRes={} resScalar={}",
            d.op.mnemonic(),
            d.n,
            d.alpha,
            summary(&d.x),
            summary(&d.y),
            summary(&d.x_res),
            summary(&d.y_res),
            d.res_scalar
        );
    }
    Ok(())
}

/// `print`: dumps the raw records.
pub fn print_program(path: &Path) -> Result<()> {
    let gen_bin = binfile::read_from_bin_file(path, &FormatParams::default())
        .with_context(|| format!("failed to read {}", path.display()))?;
    let stdout = io::stdout();
    let mut out = stdout.lock();
    gen_bin.print_program(&mut out)?;
    out.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokens(s: &str) -> Vec<String> {
        s.split_whitespace().map(String::from).collect()
    }

    #[test]
    fn amin_tuple_round_trips_through_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.bin");
        write_program(&path, &tokens("amin 8092 0 x null null null 0")).unwrap();

        let g = binfile::read_from_bin_file(&path, &FormatParams::default()).unwrap();
        let d = g.decode_all().unwrap();
        assert_eq!(d.len(), 1);
        assert_eq!(d[0].op, Opcode::Amin);
        assert_eq!(d[0].n, 8092);
        assert_eq!(d[0].alpha, 0.0);
        assert_eq!(d[0].x.as_ref().map(Vec::len), Some(8092));
        assert!(d[0].y.is_none() && d[0].x_res.is_none() && d[0].y_res.is_none());
        assert_eq!(d[0].res_scalar, 0.0);
    }

    #[test]
    fn named_slots_are_shared_and_results_are_golden() {
        let t = parse_tuples(&tokens("axpy 20 2 x y null yr 0 dot 20 0 x yr null null 0")).unwrap();
        let g = build_program(&t, FormatParams::default(), 1).unwrap();
        let d = g.decode_all().unwrap();

        let (x, y, yr) = (d[0].x.clone().unwrap(), d[0].y.clone().unwrap(), d[0].y_res.clone().unwrap());
        for i in 0..20 {
            assert!((yr[i] - (2.0 * x[i] + y[i])).abs() < 1e-6);
        }
        assert_eq!(d[1].x.as_ref(), Some(&x));
        assert_eq!(d[1].y.as_ref(), Some(&yr));
        assert_eq!(g.instrs().len(), 2);
    }

    #[test]
    fn malformed_tuples_are_rejected() {
        assert!(parse_tuples(&tokens("amin 8 0 x null null")).is_err());
        assert!(parse_tuples(&[]).is_err());
        assert!(parse_tuples(&tokens("amin -1 0 x null null null 0")).is_err());
        let t = parse_tuples(&tokens("gemm 8 0 x null null null 0")).unwrap();
        assert!(build_program(&t, FormatParams::default(), 1).is_err());
        let t = parse_tuples(&tokens("frob 8 0 x null null null 0")).unwrap();
        assert!(build_program(&t, FormatParams::default(), 1).is_err());
    }

    #[test]
    fn xorshift_stays_in_range() {
        let mut rng = XorShift::new(12345);
        assert!(rng.vector(1000).iter().all(|v| (-1.0..1.0).contains(v)));
    }
}
