//! End-to-end tests: compile whole programs and check the emitted listing.

use minic::common::Set;
use minic::front::{compile, CompileError};

fn asm(source: &str) -> String {
    compile(source).unwrap_or_else(|err| panic!("{err}\nwhile compiling: {source}"))
        .asm_code()
}

fn listing(lines: &[&str]) -> String {
    lines.iter().map(|line| format!("{line}\n")).collect()
}

#[test]
fn return_of_a_constant() {
    assert_eq!(
        asm("int main(){ return 42; }"),
        listing(&[
            "\t.text",
            "\t.global main",
            "main:",
            "\tpush %rbx",
            "\tmov $42, %rax",
            "\tpop %rbx",
            "\tret",
            "\tpop %rbx",
            "\tret",
            "\t.data",
        ])
    );
}

#[test]
fn local_declaration_assignment_and_arithmetic() {
    assert_eq!(
        asm("int main(){ int a; a = 3; return a + 4; }"),
        listing(&[
            "\t.text",
            "\t.global main",
            "main:",
            "\tpush %rbx",
            "\tsub $8, %rsp",
            "\tmov $3, %rax",
            "\tmov %rax, 0(%rsp)",
            "\tmov 0(%rsp), %rax",
            "\tadd $4, %rax",
            "\tadd $8, %rsp",
            "\tpop %rbx",
            "\tret",
            "\tadd $8, %rsp",
            "\tpop %rbx",
            "\tret",
            "\t.data",
        ])
    );
}

#[test]
fn for_loop_sums_a_range() {
    let source =
        "int main(){ int i; int s; s = 0; for (i = 0; i < 5; i = i + 1) s = s + i; return s; }";
    assert_eq!(
        asm(source),
        listing(&[
            "\t.text",
            "\t.global main",
            "main:",
            "\tpush %rbx",
            "\tsub $8, %rsp",
            "\tsub $8, %rsp",
            "\tmov $0, %rax",
            "\tmov %rax, 0(%rsp)",
            "\tmov $0, %rax",
            "\tmov %rax, 8(%rsp)",
            "l100:",
            "\tmov 8(%rsp), %rax",
            "\tcmp $5, %rax",
            "\tsetl %al",
            "\tmovzx %al, %rax",
            "\tor %rax, %rax",
            "\tjz l101",
            "\tjmp l102",
            "l103:",
            "\tmov 8(%rsp), %rax",
            "\tadd $1, %rax",
            "\tmov %rax, 8(%rsp)",
            "\tjmp l100",
            "l102:",
            "\tmov 0(%rsp), %rax",
            "\tadd 8(%rsp), %rax",
            "\tmov %rax, 0(%rsp)",
            "\tjmp l103",
            "l101:",
            "\tmov 0(%rsp), %rax",
            "\tadd $16, %rsp",
            "\tpop %rbx",
            "\tret",
            "\tadd $16, %rsp",
            "\tpop %rbx",
            "\tret",
            "\t.data",
        ])
    );
}

#[test]
fn variadic_call_with_a_string_argument() {
    let source = "int printf(char *, ...); int main(){ printf(\"hi\\n\"); return 0; }";
    assert_eq!(
        asm(source),
        listing(&[
            "\t.text",
            "\t.global main",
            "main:",
            "\tpush %rbx",
            "\tmov $l100, %rax",
            "\tmov %rax, %rdi",
            "\tcall printf",
            "\tmov $0, %rax",
            "\tpop %rbx",
            "\tret",
            "\tpop %rbx",
            "\tret",
            "\t.data",
            "l100: .string \"hi\\n\"",
        ])
    );
}

#[test]
fn two_functions_and_a_call() {
    let source = "int f(int a, int b){ return a * b + 1; } int main(){ return f(6, 7); }";
    assert_eq!(
        asm(source),
        listing(&[
            "\t.text",
            "\t.global f",
            "f:",
            "\tpush %rbx",
            "\timul %rsi, %rdi",
            "\tadd $1, %rdi",
            "\tmov %rdi, %rax",
            "\tpop %rbx",
            "\tret",
            "\tpop %rbx",
            "\tret",
            "\t.global main",
            "main:",
            "\tpush %rbx",
            "\tmov $6, %rdi",
            "\tmov $7, %rsi",
            "\tcall f",
            "\tpop %rbx",
            "\tret",
            "\tpop %rbx",
            "\tret",
            "\t.data",
        ])
    );
}

#[test]
fn while_loop_counts_down() {
    let source = "int main(){ int i; i = 10; while (i > 0) i = i - 1; return i; }";
    assert_eq!(
        asm(source),
        listing(&[
            "\t.text",
            "\t.global main",
            "main:",
            "\tpush %rbx",
            "\tsub $8, %rsp",
            "\tmov $10, %rax",
            "\tmov %rax, 0(%rsp)",
            "l100:",
            "\tmov 0(%rsp), %rax",
            "\tcmp $0, %rax",
            "\tsetg %al",
            "\tmovzx %al, %rax",
            "\tor %rax, %rax",
            "\tjz l101",
            "\tmov 0(%rsp), %rax",
            "\tsub $1, %rax",
            "\tmov %rax, 0(%rsp)",
            "\tjmp l100",
            "l101:",
            "\tmov 0(%rsp), %rax",
            "\tadd $8, %rsp",
            "\tpop %rbx",
            "\tret",
            "\tadd $8, %rsp",
            "\tpop %rbx",
            "\tret",
            "\t.data",
        ])
    );
}

#[test]
fn call_sites_are_padded_to_alignment() {
    // With k locals the depth is 8 + 8k; an odd k needs an extra 8 bytes of
    // padding before the call, an even k needs none.
    for locals in 0..=6usize {
        let decls: String = (0..locals).map(|i| format!("int x{i}; ")).collect();
        let source = format!("int f(); int main(){{ {decls}f(); return 0; }}");
        let out = asm(&source);

        let lines: Vec<&str> = out.lines().collect();
        let call_at = lines
            .iter()
            .position(|l| *l == "\tcall f")
            .unwrap_or_else(|| panic!("no call in:\n{out}"));
        let subs = lines[..call_at]
            .iter()
            .filter(|l| **l == "\tsub $8, %rsp")
            .count();
        assert_eq!(subs, locals + locals % 2, "locals={locals}:\n{out}");
    }
}

#[test]
fn block_exit_releases_local_stack_space() {
    let out = asm("int main(){ if (1) { int a; a = 1; } return 0; }");
    let lines: Vec<&str> = out.lines().collect();

    let reserve = lines.iter().position(|l| *l == "\tsub $8, %rsp").unwrap();
    let release = lines.iter().position(|l| *l == "\tadd $8, %rsp").unwrap();
    let skip = lines.iter().position(|l| *l == "l100:").unwrap();
    assert!(reserve < release && release < skip);

    // Exactly one reserve and one matching release
    assert_eq!(lines.iter().filter(|l| **l == "\tsub $8, %rsp").count(), 1);
    assert_eq!(lines.iter().filter(|l| **l == "\tadd $8, %rsp").count(), 1);
}

#[test]
fn labels_are_unique_and_resolved() {
    let source = "int puts(char *, ...); \
         int main(){ \
             int i; \
             for (i = 0; i < 3; i = i + 1) { \
                 if (i > 1) puts(\"big\\n\"); \
                 while (i) i = i - 1; \
             } \
             return 0; \
         }";
    let out = asm(source);

    let mut defined = Set::new();
    for line in out.lines() {
        if let Some((name, _)) = line.split_once(':') {
            if let Some(num) = name.strip_prefix('l') {
                if num.chars().all(|c| c.is_ascii_digit()) {
                    assert!(defined.insert(num.to_string()), "duplicate label l{num}");
                }
            }
        }
    }

    for line in out.lines() {
        let line = line.trim_start();
        let target = line
            .strip_prefix("jz l")
            .or_else(|| line.strip_prefix("jmp l"))
            .or_else(|| line.strip_prefix("mov $l").map(|r| r.split(',').next().unwrap()));
        if let Some(num) = target {
            assert!(defined.contains(num), "undefined label l{num} in `{line}`");
        }
    }
}

#[test]
fn string_literals_pass_through_verbatim() {
    let out = asm(
        "int puts(char *); int main(){ puts(\"a\\n\"); puts(\"b\\t\"); return 0; }",
    );
    let data = &out[out.find("\t.data").unwrap()..];

    // Raw bytes, one directive each, reverse insertion order
    assert!(data.contains("l100: .string \"a\\n\""));
    assert!(data.contains("l101: .string \"b\\t\""));
    assert_eq!(data.matches(".string").count(), 2);
    assert!(data.find("l101").unwrap() < data.find("l100").unwrap());
}

#[test]
fn argument_registers_follow_the_reduced_convention() {
    let out = asm("int p(int, ...); int main(){ p(1, 2, 3, 4, 5, 6, 7, 8); return 0; }");
    for mov in [
        "\tmov $1, %rdi",
        "\tmov $2, %rsi",
        "\tmov $3, %rdx",
        "\tmov $4, %rcx",
        "\tmov $5, %rbx",
        "\tmov $6, %rax",
    ] {
        assert!(out.contains(mov), "missing `{mov}` in:\n{out}");
    }
    // The seventh and eighth arguments are evaluated but never passed
    assert!(!out.contains("$7"));
    assert!(!out.contains("$8"));
}

#[test]
fn globals_are_referenced_by_name() {
    let out = asm("int counter; int main(){ counter = 5; return counter; }");
    assert!(out.contains("\tmov %rax, counter"));
    assert!(out.contains("\tmov counter, %rax"));
}

#[test]
fn unary_minus_negates_in_place() {
    let out = asm("int main(){ int a; a = 7; return -a; }");
    assert!(out.contains("\tmov 0(%rsp), %rax\n\tneg %rax"));
}

#[test]
fn nested_calls_spill_the_outer_result() {
    let out = asm("int f(int); int main(){ return f(1) + f(2); }");
    // The first call's result lives in %rax, which the second call needs
    // both as a free register and across the call itself.
    assert!(out.contains("\tpush %rax"), "no spill in:\n{out}");
    assert_eq!(out.matches("\tcall f").count(), 2);
}

#[test]
fn compile_errors() {
    assert!(matches!(
        compile("int main(){ return x; }"),
        Err(CompileError::Undefined(_))
    ));
    assert!(matches!(
        compile("int x; int x;"),
        Err(CompileError::Redefined(_))
    ));
    assert!(matches!(
        compile("int main(){ int x; x(); }"),
        Err(CompileError::CallingNonFunction(_))
    ));
    assert!(matches!(
        compile("int f(int); int main(){ return f(1, 2); }"),
        Err(CompileError::TooManyArguments(_))
    ));
    assert!(matches!(
        compile("int main(){ return (int)1; }"),
        Err(CompileError::Cast)
    ));
    assert!(matches!(
        compile("int main(){ return 1 }"),
        Err(CompileError::Expected { .. })
    ));
    assert!(matches!(
        compile("42;"),
        Err(CompileError::ExpectedDeclaration)
    ));
    assert!(matches!(
        compile("int;"),
        Err(CompileError::ExpectedIdentifier)
    ));
    assert!(matches!(
        compile("int main(){ return @; }"),
        Err(CompileError::Lex(_))
    ));
}
