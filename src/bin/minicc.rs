//! the main compiler binary. takes a source file and an optional output
//! format (assembly by default), and writes the result to stdout.
//!
//! run with `--help` for more info.

use minic::front::{self, lex};

use clap::{Parser, ValueEnum};

#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
struct Args {
    /// the input file
    file: String,
    /// the output format
    #[arg(value_enum, short, long, default_value_t = Output::Asm)]
    out: Output,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, ValueEnum)]
enum Output {
    /// the list of tokens
    Tokens,
    /// the resulting assembly code
    Asm,
}

fn main() {
    use Output::*;
    let args = Args::parse();

    let input = String::from_utf8(std::fs::read(&args.file).expect("file should be readable"))
        .expect("input characters should be utf8");

    match args.out {
        Tokens => {
            let mut lexer = lex::Lexer::new(&input);
            loop {
                match lexer.next() {
                    Ok(Some(token)) => println!("{token}"),
                    Ok(None) => break,
                    Err(err) => {
                        eprintln!("{err}");
                        std::process::exit(1);
                    }
                }
            }
        }
        Asm => match front::compile(&input) {
            Ok(assembly) => print!("{}", assembly.asm_code()),
            Err(err) => {
                eprintln!("{err}");
                std::process::exit(1);
            }
        },
    }
}
