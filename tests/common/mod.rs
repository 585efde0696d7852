//! Shared test fixture: builds a small deterministic model file on disk
//! through the public format API.

use recordar::format::{FileHeader, TensorHeader, TensorType, FILE_VERSION};
use std::io::Write;
use std::path::Path;

/// Deterministic pseudo-random weights, reproducible across runs without a
/// random-number dependency.
pub struct Lcg(pub u64);

impl Lcg {
    pub fn next_f32(&mut self) -> f32 {
        self.0 = self.0.wrapping_mul(6_364_136_223_846_793_005).wrapping_add(1);
        ((self.0 >> 33) as f32 / (1u64 << 31) as f32) - 0.5
    }

    fn values(&mut self, n: usize, scale: f32) -> Vec<f32> {
        (0..n).map(|_| self.next_f32() * scale).collect()
    }
}

/// Shape of the synthetic model
#[derive(Clone, Copy)]
pub struct ModelShape {
    pub n_vocab: u32,
    pub n_embed: u32,
    pub n_layer: u32,
    pub n_ffn: u32,
}

/// A small model whose widths are block multiples, so the same fixture
/// serves the quantizer tests.
pub const TINY: ModelShape = ModelShape {
    n_vocab: 256,
    n_embed: 32,
    n_layer: 2,
    n_ffn: 64,
};

fn write_tensor<W: Write>(writer: &mut W, name: &str, width: u32, height: Option<u32>, values: &[f32]) {
    let header = TensorHeader {
        dim_count: if height.is_some() { 2 } else { 1 },
        key_length: name.len() as u32,
        data_type: TensorType::F32,
        width,
        height: height.unwrap_or(1),
    };
    assert_eq!(values.len() as u64, header.element_count());

    header.write(writer).unwrap();
    writer.write_all(name.as_bytes()).unwrap();
    for v in values {
        writer.write_all(&v.to_le_bytes()).unwrap();
    }
}

/// Write a complete F32 model file at `path`.
pub fn write_tiny_model(path: &Path, shape: ModelShape) {
    let mut rng = Lcg(7);
    let mut file = std::io::BufWriter::new(std::fs::File::create(path).unwrap());

    FileHeader {
        version: FILE_VERSION,
        n_vocab: shape.n_vocab,
        n_embed: shape.n_embed,
        n_layer: shape.n_layer,
        data_type: TensorType::F32,
    }
    .write(&mut file)
    .unwrap();

    let e = shape.n_embed as usize;
    let f = shape.n_ffn as usize;
    let v = shape.n_vocab as usize;

    write_tensor(
        &mut file,
        "emb.weight",
        shape.n_embed,
        Some(shape.n_vocab),
        &rng.values(e * v, 0.4),
    );
    write_tensor(&mut file, "blocks.0.ln0.weight", shape.n_embed, None, &rng.values(e, 1.0));
    write_tensor(&mut file, "blocks.0.ln0.bias", shape.n_embed, None, &rng.values(e, 0.1));

    for i in 0..shape.n_layer {
        let name = |suffix: &str| format!("blocks.{i}.{suffix}");

        for suffix in ["ln1.weight", "ln2.weight"] {
            write_tensor(&mut file, &name(suffix), shape.n_embed, None, &rng.values(e, 1.0));
        }
        for suffix in ["ln1.bias", "ln2.bias"] {
            write_tensor(&mut file, &name(suffix), shape.n_embed, None, &rng.values(e, 0.1));
        }

        // Mixing coefficients sit in (0, 1), decay stays negative.
        for suffix in [
            "att.time_mix_k",
            "att.time_mix_v",
            "att.time_mix_r",
            "ffn.time_mix_k",
            "ffn.time_mix_r",
        ] {
            let values: Vec<f32> = (0..e).map(|_| rng.next_f32().abs().min(0.95)).collect();
            write_tensor(&mut file, &name(suffix), shape.n_embed, None, &values);
        }
        write_tensor(&mut file, &name("att.time_first"), shape.n_embed, None, &rng.values(e, 0.5));
        let decay: Vec<f32> = (0..e).map(|_| -rng.next_f32().abs() - 0.1).collect();
        write_tensor(&mut file, &name("att.time_decay"), shape.n_embed, None, &decay);

        for suffix in [
            "att.key.weight",
            "att.value.weight",
            "att.receptance.weight",
            "att.output.weight",
            "ffn.receptance.weight",
        ] {
            write_tensor(
                &mut file,
                &name(suffix),
                shape.n_embed,
                Some(shape.n_embed),
                &rng.values(e * e, 0.3),
            );
        }
        write_tensor(
            &mut file,
            &name("ffn.key.weight"),
            shape.n_embed,
            Some(shape.n_ffn),
            &rng.values(e * f, 0.3),
        );
        write_tensor(
            &mut file,
            &name("ffn.value.weight"),
            shape.n_ffn,
            Some(shape.n_embed),
            &rng.values(f * e, 0.3),
        );
    }

    write_tensor(&mut file, "ln_out.weight", shape.n_embed, None, &rng.values(e, 1.0));
    write_tensor(&mut file, "ln_out.bias", shape.n_embed, None, &rng.values(e, 0.1));
    write_tensor(
        &mut file,
        "head.weight",
        shape.n_embed,
        Some(shape.n_vocab),
        &rng.values(e * v, 0.4),
    );

    file.flush().unwrap();
}
