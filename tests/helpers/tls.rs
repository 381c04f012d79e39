use std::sync::{Arc, Mutex};

use boring::pkey::PKey;
use boring::ssl::{select_next_proto, AlpnError, SslAcceptor, SslAcceptorBuilder, SslMethod};
use boring::x509::X509;

/// Self-signed certificate for 127.0.0.1; returns the acceptor builder and the PEM cert.
pub fn generate_cert_bundle() -> (SslAcceptorBuilder, Vec<u8>) {
    let subject_alt_names = vec!["127.0.0.1".to_string(), "localhost".to_string()];
    let cert = rcgen::generate_simple_self_signed(subject_alt_names).expect("Failed to generate cert");
    let cert_pem = cert.cert.pem();
    let key_pem = cert.signing_key.serialize_pem();

    let pkey = PKey::private_key_from_pem(key_pem.as_bytes()).expect("Failed to parse private key");
    let x509 = X509::from_pem(cert_pem.as_bytes()).expect("Failed to parse certificate");

    let mut builder =
        SslAcceptor::mozilla_intermediate_v5(SslMethod::tls()).expect("Failed to create SslAcceptor builder");
    builder.set_private_key(&pkey).expect("Failed to set private key");
    builder.set_certificate(&x509).expect("Failed to set certificate");
    (builder, cert_pem.into_bytes())
}

/// Split an ALPN wire list into protocol names.
pub fn parse_alpn(mut wire: &[u8]) -> Vec<String> {
    let mut out = Vec::new();
    while let Some((&len, rest)) = wire.split_first() {
        let len = len as usize;
        if rest.len() < len {
            break;
        }
        out.push(String::from_utf8_lossy(&rest[..len]).into_owned());
        wire = &rest[len..];
    }
    out
}

/// Acceptor that selects from `server_protos` and records what each client offered.
pub fn acceptor(server_protos: &'static [u8], offered: Arc<Mutex<Vec<Vec<String>>>>) -> (SslAcceptor, Vec<u8>) {
    let (mut builder, ca_cert) = generate_cert_bundle();
    builder.set_alpn_select_callback(move |_, client_protos| {
        offered.lock().unwrap().push(parse_alpn(client_protos));
        select_next_proto(server_protos, client_protos).ok_or(AlpnError::NOACK)
    });
    (builder.build(), ca_cert)
}
