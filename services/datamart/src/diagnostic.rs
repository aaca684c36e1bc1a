//! Failure serialization for hist_bases.msg_erro.
//!
//! Errors are persisted as `key:value` pairs joined by `|`: the root
//! cause's classification and message, then the whole context chain from
//! the outermost frame inward. This row is the only durable surface a
//! failed run leaves behind.

pub fn diagnostico_erro(err: &anyhow::Error) -> String {
    let mensagens: Vec<String> = err
        .chain()
        .map(|cause| cause.to_string().replace(['\n', '\r'], " "))
        .collect();
    let raiz = mensagens.last().cloned().unwrap_or_default();
    format!(
        "tipo_erro:{}|mensagem_erro:{}|mensagem_next:[{}]",
        tipo_da_causa(err.root_cause()),
        raiz,
        mensagens.join(", ")
    )
}

fn tipo_da_causa(cause: &(dyn std::error::Error + 'static)) -> &'static str {
    if cause.downcast_ref::<sqlx::Error>().is_some() {
        "sqlx"
    } else if cause.downcast_ref::<std::io::Error>().is_some() {
        "io"
    } else if cause.downcast_ref::<chrono::ParseError>().is_some() {
        "data"
    } else if cause.downcast_ref::<std::num::ParseIntError>().is_some()
        || cause.downcast_ref::<std::num::ParseFloatError>().is_some()
    {
        "numero"
    } else {
        "erro"
    }
}
