use base64::{
    alphabet,
    engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig},
    Engine as _,
};
use encoding_rs::Encoding;
use mailparse::{MailAddr, MailHeader, MailHeaderMap, MailParseError, ParsedMail};
use regex::Regex;

const ENCODED_WORD_PATTERN: &str = r"=\?([^?\s]+)\?([BbQq])\?([^?\s]*)\?=";

/// Mailers are inconsistent about padding encoded words, so accept either.
const LENIENT_BASE64: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// An email in its unadorned form, as fetched from the server.
#[derive(Clone, Debug)]
pub struct Message {
    raw: Vec<u8>,
}

/// A message with its sender and subject decoded. Either may be empty if the headers were missing
/// or malformed; nothing downstream may rely on them being populated.
pub struct DecodedMessage<'a> {
    sender: String,
    subject: String,
    tree: Option<ParsedMail<'a>>,
}

impl Message {
    #[must_use]
    pub fn new(raw: Vec<u8>) -> Self {
        Self { raw }
    }

    #[must_use]
    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    /// Parse the message into its MIME tree.
    ///
    /// # Errors
    /// Returns an error if the message is not valid MIME.
    pub fn parsed(&self) -> Result<ParsedMail<'_>, MailParseError> {
        mailparse::parse_mail(&self.raw)
    }

    /// Decode the sender, subject and content tree. This never fails; unparseable parts simply come
    /// back empty.
    #[must_use]
    pub fn decode(&self) -> DecodedMessage<'_> {
        match self.parsed() {
            Ok(parsed) => {
                let sender = parsed
                    .headers
                    .get_first_value("From")
                    .map(|from| bare_address(&from))
                    .unwrap_or_default();
                let subject = raw_header(&parsed.headers, "Subject")
                    .map(|subject| decode_encoded_words(&subject))
                    .unwrap_or_default();

                DecodedMessage {
                    sender,
                    subject: subject.trim().to_string(),
                    tree: Some(parsed),
                }
            }
            Err(err) => {
                warn!("Message could not be parsed, treating it as empty: {err}");
                DecodedMessage {
                    sender: String::new(),
                    subject: String::new(),
                    tree: None,
                }
            }
        }
    }
}

impl<'a> DecodedMessage<'a> {
    /// The bare sender address, e.g. `service@mail.alipay.com`.
    #[must_use]
    pub fn sender(&self) -> &str {
        &self.sender
    }

    #[must_use]
    pub fn subject(&self) -> &str {
        &self.subject
    }

    #[must_use]
    pub fn tree(&self) -> Option<&ParsedMail<'a>> {
        self.tree.as_ref()
    }
}

/// The value of the first header called `name`, unfolded but with any encoded-words left intact.
/// Raw 8-bit values that are not UTF-8 are read as GBK.
#[must_use]
pub fn raw_header(headers: &[MailHeader<'_>], name: &str) -> Option<String> {
    let header = headers
        .iter()
        .find(|header| header.get_key().eq_ignore_ascii_case(name))?;
    let raw = header.get_value_raw();
    let text = match std::str::from_utf8(raw) {
        Ok(text) => text.to_string(),
        Err(_) => encoding_rs::GBK.decode(raw).0.into_owned(),
    };

    Some(text.replace("\r\n", "").replace('\n', ""))
}

/// Decode every RFC2047 encoded-word in `text` with its own charset. Whitespace between two
/// adjacent encoded-words is dropped, and any other text, including text that is already Unicode,
/// is kept as it is. Words that can't be decoded are left verbatim.
#[must_use]
pub fn decode_encoded_words(text: &str) -> String {
    // If this is malformed it's programmer error
    let word_regexp =
        Regex::new(ENCODED_WORD_PATTERN).expect("failed to create regex for encoded words");

    let mut decoded = String::with_capacity(text.len());
    let mut last_end = 0;
    let mut after_word = false;
    for captures in word_regexp.captures_iter(text) {
        let Some(word) = captures.get(0) else {
            continue;
        };

        let between = &text[last_end..word.start()];
        if !(after_word && between.trim().is_empty()) {
            decoded.push_str(between);
        }

        match decode_word(&captures[1], &captures[2], &captures[3]) {
            Some(word_text) => {
                decoded.push_str(&word_text);
                after_word = true;
            }
            None => {
                debug!("Could not decode '{}', using it verbatim", word.as_str());
                decoded.push_str(word.as_str());
                after_word = false;
            }
        }
        last_end = word.end();
    }
    decoded.push_str(&text[last_end..]);

    decoded
}

fn decode_word(charset: &str, encoding: &str, payload: &str) -> Option<String> {
    // RFC 2231 allows a language after the charset, e.g. `UTF-8*zh`
    let charset = charset.split('*').next().unwrap_or(charset);
    let encoding_for_charset = Encoding::for_label(charset.as_bytes())?;

    let bytes = if encoding.eq_ignore_ascii_case("b") {
        LENIENT_BASE64.decode(payload).ok()?
    } else {
        decode_quoted_printable_word(payload)?
    };

    let (text, had_errors) = encoding_for_charset.decode_without_bom_handling(&bytes);
    if had_errors {
        debug!("Encoded word is not entirely valid {charset}");
    }

    Some(text.into_owned())
}

/// The `Q` encoding: quoted-printable where `_` stands for a space.
fn decode_quoted_printable_word(payload: &str) -> Option<Vec<u8>> {
    let mut bytes = Vec::with_capacity(payload.len());
    let mut input = payload.bytes();
    while let Some(byte) = input.next() {
        match byte {
            b'_' => bytes.push(b' '),
            b'=' => {
                let high = char::from(input.next()?).to_digit(16)?;
                let low = char::from(input.next()?).to_digit(16)?;
                bytes.push(u8::try_from(high * 16 + low).ok()?);
            }
            other => bytes.push(other),
        }
    }

    Some(bytes)
}

/// Extract `addr` from `Display Name <addr>`. Returns an empty string if no address can be found.
fn bare_address(from: &str) -> String {
    let parsed_address = mailparse::addrparse(from).ok().and_then(|addrs| {
        addrs.iter().find_map(|addr| match addr {
            MailAddr::Single(info) => Some(info.addr.clone()),
            MailAddr::Group(group) => group.addrs.first().map(|info| info.addr.clone()),
        })
    });

    if let Some(address) = parsed_address {
        return address;
    }

    // If this is malformed it's programmer error
    let angle_regexp =
        Regex::new(r"<([^<>\s]+@[^<>\s]+)>").expect("failed to create regex for address");
    angle_regexp
        .captures(from)
        .and_then(|captures| captures.get(1))
        .map(|address| address.as_str().to_string())
        .unwrap_or_default()
}
