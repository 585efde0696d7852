//! Recordar CLI - model file inspection and requantization
//!
//! The inference core is a library; this binary wraps its two offline
//! operations: printing what a model file contains and rewriting it into a
//! lower-precision format.

use clap::{Parser, Subcommand};
use recordar::{format, quantize_file, system_info, RecordarError, TensorType, VERSION};
use std::fs::File;
use std::io::BufReader;

/// Recordar - RWKV single-token inference engine
#[derive(Parser)]
#[command(name = "recordar")]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Requantize a model file into a lower-precision format
    Quantize {
        /// Source model file (f32 or f16)
        input: String,

        /// Destination model file
        output: String,

        /// Target data type: f32, f16, Q4_0, Q4_1, Q5_0, Q5_1 or Q8_0
        #[arg(short, long, default_value = "Q5_1")]
        format: String,
    },
    /// Print the header of a model file and the CPU features in use
    Info {
        /// Model file to inspect
        model: String,
    },
}

fn main() {
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Quantize {
            input,
            output,
            format,
        } => quantize(&input, &output, &format),
        Commands::Info { model } => info(&model),
    };

    if let Err(e) = result {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

fn quantize(input: &str, output: &str, format: &str) -> recordar::Result<()> {
    let target = TensorType::from_name(format).ok_or_else(|| RecordarError::Args {
        reason: format!("unknown data type name {format}"),
    })?;

    println!("Quantizing '{input}' into '{output}' as {target}");
    let summary = quantize_file(input, output, target)?;

    for report in &summary.tensors {
        print!(
            "{:>48} - [{:>5}, {:>5}], type = {:>6} ",
            report.name, report.width, report.height, report.source_type
        );
        match &report.histogram {
            Some(hist) => {
                print!(
                    "quantizing... size = {:8.2} MB -> {:8.2} MB | hist: ",
                    report.original_bytes as f64 / 1024.0 / 1024.0,
                    report.new_bytes as f64 / 1024.0 / 1024.0
                );
                let elements = u64::from(report.width) * u64::from(report.height);
                for count in hist {
                    print!("{:5.3} ", *count as f64 / elements as f64);
                }
                println!();
            }
            None => {
                println!(
                    "size = {:8.3} MB",
                    report.original_bytes as f64 / 1024.0 / 1024.0
                );
            }
        }
    }

    println!(
        "original size     = {:8.2} MB",
        summary.original_bytes as f64 / 1024.0 / 1024.0
    );
    println!(
        "quantized size    = {:8.2} MB",
        summary.new_bytes as f64 / 1024.0 / 1024.0
    );
    println!("compression ratio = {:8.2}", summary.compression_ratio());

    let total: i64 = summary.histogram.iter().sum();
    if total > 0 {
        print!("hist: ");
        for count in &summary.histogram {
            print!("{:5.3} ", *count as f64 / total as f64);
        }
        println!();
    }

    Ok(())
}

fn info(model: &str) -> recordar::Result<()> {
    let file = File::open(model).map_err(|e| RecordarError::FileOpen {
        path: model.to_string(),
        source: e,
    })?;
    let header = format::FileHeader::read(&mut BufReader::new(file))?;

    println!("Recordar v{VERSION}");
    println!("file:       {model}");
    println!("version:    {}", header.version);
    println!("vocabulary: {}", header.n_vocab);
    println!("embedding:  {}", header.n_embed);
    println!("layers:     {}", header.n_layer);
    println!("data type:  {}", header.data_type);
    println!("system:     {}", system_info());

    Ok(())
}
