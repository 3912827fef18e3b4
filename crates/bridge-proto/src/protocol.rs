use thiserror::Error;

// ── message tags ──────────────────────────────────────────────────────────────

/// Fixed u16 tags.  These are the wire contract with the display and must
/// never be renumbered.
pub const TAG_PING: u16 = 0;
pub const TAG_PONG: u16 = 1;
pub const TAG_SET_MUSIC_INFO: u16 = 2;
pub const TAG_SET_ALBUM_COVER_URI: u16 = 3;
pub const TAG_SET_ALBUM_COVER_DATA: u16 = 4;
pub const TAG_ON_PLAY_PROGRESS: u16 = 5;
pub const TAG_ON_VOLUME_CHANGED: u16 = 6;
pub const TAG_ON_PAUSED: u16 = 7;
pub const TAG_ON_RESUMED: u16 = 8;
pub const TAG_ON_AUDIO_DATA: u16 = 9;
pub const TAG_SET_LYRIC: u16 = 10;
pub const TAG_SET_LYRIC_FROM_TTML: u16 = 11;
pub const TAG_PAUSE: u16 = 12;
pub const TAG_RESUME: u16 = 13;
pub const TAG_FORWARD_SONG: u16 = 14;
pub const TAG_BACKWARD_SONG: u16 = 15;
pub const TAG_SET_VOLUME: u16 = 16;
pub const TAG_SEEK_PLAY_PROGRESS: u16 = 17;

// Smallest possible encodings, used to reject absurd counts before allocating.
const MIN_ARTIST_LEN: usize = 2;
const MIN_WORD_LEN: usize = 8 + 8 + 1;
const MIN_LINE_LEN: usize = 8 + 8 + 4 + 1 + 1 + 1;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("unknown message tag {0}")]
    UnknownTag(u16),
    #[error("unexpected end of buffer at offset {offset}: need {needed} bytes, {available} left")]
    UnexpectedEof {
        offset: usize,
        needed: usize,
        available: usize,
    },
    #[error("count {count} at offset {offset} exceeds the {remaining} bytes left")]
    CountTooLarge {
        offset: usize,
        count: u32,
        remaining: usize,
    },
    #[error("string at offset {0} has no NUL terminator")]
    UnterminatedString(usize),
    #[error("string at offset {0} is not valid UTF-8")]
    InvalidUtf8(usize),
    #[error("string contains an embedded NUL")]
    EmbeddedNul,
    #[error("sequence of {0} items does not fit a u32 count")]
    LengthOverflow(usize),
}

// ── payload types ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Artist {
    pub id: String,
    pub name: String,
}

/// Payload of `SetMusicInfo`.  Ids are strings on the wire even though the
/// player hands out integers.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MusicInfo {
    pub music_id: String,
    pub music_name: String,
    pub album_id: String,
    pub album_name: String,
    pub artists: Vec<Artist>,
    /// Track length in milliseconds.
    pub duration: u64,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct LyricWord {
    pub start_time: u64,
    pub end_time: u64,
    pub word: String,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct LyricLine {
    pub start_time: u64,
    pub end_time: u64,
    pub words: Vec<LyricWord>,
    pub translated_lyric: String,
    pub roman_lyric: String,
    pub flag: u8,
}

/// Every message the display understands, in either direction.
///
/// Outbound (bridge → display): `SetMusicInfo` .. `SetLyricFromTtml`.
/// Inbound (display → bridge): `Pause` .. `SeekPlayProgress`.
/// `Ping`/`Pong` flow both ways.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Ping,
    Pong,
    SetMusicInfo(MusicInfo),
    SetMusicAlbumCoverImageUri { img_url: String },
    SetMusicAlbumCoverImageData { data: Vec<u8> },
    OnPlayProgress { progress: u64 },
    OnVolumeChanged { volume: f64 },
    OnPaused,
    OnResumed,
    OnAudioData { data: Vec<u8> },
    SetLyric { data: Vec<LyricLine> },
    /// Raw TTML document, passed through verbatim.
    SetLyricFromTtml { data: String },
    Pause,
    Resume,
    ForwardSong,
    BackwardSong,
    SetVolume { volume: f64 },
    SeekPlayProgress { progress: u64 },
}

impl Message {
    pub fn tag(&self) -> u16 {
        match self {
            Message::Ping => TAG_PING,
            Message::Pong => TAG_PONG,
            Message::SetMusicInfo(_) => TAG_SET_MUSIC_INFO,
            Message::SetMusicAlbumCoverImageUri { .. } => TAG_SET_ALBUM_COVER_URI,
            Message::SetMusicAlbumCoverImageData { .. } => TAG_SET_ALBUM_COVER_DATA,
            Message::OnPlayProgress { .. } => TAG_ON_PLAY_PROGRESS,
            Message::OnVolumeChanged { .. } => TAG_ON_VOLUME_CHANGED,
            Message::OnPaused => TAG_ON_PAUSED,
            Message::OnResumed => TAG_ON_RESUMED,
            Message::OnAudioData { .. } => TAG_ON_AUDIO_DATA,
            Message::SetLyric { .. } => TAG_SET_LYRIC,
            Message::SetLyricFromTtml { .. } => TAG_SET_LYRIC_FROM_TTML,
            Message::Pause => TAG_PAUSE,
            Message::Resume => TAG_RESUME,
            Message::ForwardSong => TAG_FORWARD_SONG,
            Message::BackwardSong => TAG_BACKWARD_SONG,
            Message::SetVolume { .. } => TAG_SET_VOLUME,
            Message::SeekPlayProgress { .. } => TAG_SEEK_PLAY_PROGRESS,
        }
    }

    /// camelCase protocol name, for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Message::Ping => "ping",
            Message::Pong => "pong",
            Message::SetMusicInfo(_) => "setMusicInfo",
            Message::SetMusicAlbumCoverImageUri { .. } => "setMusicAlbumCoverImageURI",
            Message::SetMusicAlbumCoverImageData { .. } => "setMusicAlbumCoverImageData",
            Message::OnPlayProgress { .. } => "onPlayProgress",
            Message::OnVolumeChanged { .. } => "onVolumeChanged",
            Message::OnPaused => "onPaused",
            Message::OnResumed => "onResumed",
            Message::OnAudioData { .. } => "onAudioData",
            Message::SetLyric { .. } => "setLyric",
            Message::SetLyricFromTtml { .. } => "setLyricFromTTML",
            Message::Pause => "pause",
            Message::Resume => "resume",
            Message::ForwardSong => "forwardSong",
            Message::BackwardSong => "backwardSong",
            Message::SetVolume { .. } => "setVolume",
            Message::SeekPlayProgress { .. } => "seekPlayProgress",
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let mut w = Writer::default();
        w.u16(self.tag());

        match self {
            Message::Ping
            | Message::Pong
            | Message::OnPaused
            | Message::OnResumed
            | Message::Pause
            | Message::Resume
            | Message::ForwardSong
            | Message::BackwardSong => {}
            Message::SetMusicInfo(info) => {
                w.string(&info.music_id)?;
                w.string(&info.music_name)?;
                w.string(&info.album_id)?;
                w.string(&info.album_name)?;
                w.vec(&info.artists, |w, artist| {
                    w.string(&artist.id)?;
                    w.string(&artist.name)
                })?;
                w.u64(info.duration);
            }
            Message::SetMusicAlbumCoverImageUri { img_url } => w.string(img_url)?,
            Message::SetMusicAlbumCoverImageData { data } | Message::OnAudioData { data } => {
                w.bytes(data)?
            }
            Message::OnPlayProgress { progress } | Message::SeekPlayProgress { progress } => {
                w.u64(*progress)
            }
            Message::OnVolumeChanged { volume } | Message::SetVolume { volume } => w.f64(*volume),
            Message::SetLyric { data } => w.vec(data, write_line)?,
            Message::SetLyricFromTtml { data } => w.string(data)?,
        }

        Ok(w.buf)
    }

    pub fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        let mut r = Reader::new(data);
        let tag = r.u16()?;

        let msg = match tag {
            TAG_PING => Message::Ping,
            TAG_PONG => Message::Pong,
            TAG_SET_MUSIC_INFO => Message::SetMusicInfo(MusicInfo {
                music_id: r.string()?,
                music_name: r.string()?,
                album_id: r.string()?,
                album_name: r.string()?,
                artists: r.vec(MIN_ARTIST_LEN, |r| {
                    Ok(Artist {
                        id: r.string()?,
                        name: r.string()?,
                    })
                })?,
                duration: r.u64()?,
            }),
            TAG_SET_ALBUM_COVER_URI => Message::SetMusicAlbumCoverImageUri {
                img_url: r.string()?,
            },
            TAG_SET_ALBUM_COVER_DATA => Message::SetMusicAlbumCoverImageData { data: r.bytes()? },
            TAG_ON_PLAY_PROGRESS => Message::OnPlayProgress { progress: r.u64()? },
            TAG_ON_VOLUME_CHANGED => Message::OnVolumeChanged { volume: r.f64()? },
            TAG_ON_PAUSED => Message::OnPaused,
            TAG_ON_RESUMED => Message::OnResumed,
            TAG_ON_AUDIO_DATA => Message::OnAudioData { data: r.bytes()? },
            TAG_SET_LYRIC => Message::SetLyric {
                data: r.vec(MIN_LINE_LEN, read_line)?,
            },
            TAG_SET_LYRIC_FROM_TTML => Message::SetLyricFromTtml { data: r.string()? },
            TAG_PAUSE => Message::Pause,
            TAG_RESUME => Message::Resume,
            TAG_FORWARD_SONG => Message::ForwardSong,
            TAG_BACKWARD_SONG => Message::BackwardSong,
            TAG_SET_VOLUME => Message::SetVolume { volume: r.f64()? },
            TAG_SEEK_PLAY_PROGRESS => Message::SeekPlayProgress { progress: r.u64()? },
            other => return Err(ProtocolError::UnknownTag(other)),
        };

        Ok(msg)
    }
}

fn write_line(w: &mut Writer, line: &LyricLine) -> Result<(), ProtocolError> {
    w.u64(line.start_time);
    w.u64(line.end_time);
    w.vec(&line.words, |w, word| {
        w.u64(word.start_time);
        w.u64(word.end_time);
        w.string(&word.word)
    })?;
    w.string(&line.translated_lyric)?;
    w.string(&line.roman_lyric)?;
    w.u8(line.flag);
    Ok(())
}

fn read_line(r: &mut Reader<'_>) -> Result<LyricLine, ProtocolError> {
    Ok(LyricLine {
        start_time: r.u64()?,
        end_time: r.u64()?,
        words: r.vec(MIN_WORD_LEN, |r| {
            Ok(LyricWord {
                start_time: r.u64()?,
                end_time: r.u64()?,
                word: r.string()?,
            })
        })?,
        translated_lyric: r.string()?,
        roman_lyric: r.string()?,
        flag: r.u8()?,
    })
}

// ── writer ────────────────────────────────────────────────────────────────────

#[derive(Default)]
struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    fn u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    fn u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn f64(&mut self, v: f64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn count(&mut self, len: usize) -> Result<(), ProtocolError> {
        let count = u32::try_from(len).map_err(|_| ProtocolError::LengthOverflow(len))?;
        self.u32(count);
        Ok(())
    }

    fn string(&mut self, s: &str) -> Result<(), ProtocolError> {
        if s.as_bytes().contains(&0) {
            return Err(ProtocolError::EmbeddedNul);
        }
        self.buf.extend_from_slice(s.as_bytes());
        self.buf.push(0);
        Ok(())
    }

    fn bytes(&mut self, data: &[u8]) -> Result<(), ProtocolError> {
        self.count(data.len())?;
        self.buf.extend_from_slice(data);
        Ok(())
    }

    fn vec<T>(
        &mut self,
        items: &[T],
        mut item: impl FnMut(&mut Self, &T) -> Result<(), ProtocolError>,
    ) -> Result<(), ProtocolError> {
        self.count(items.len())?;
        for it in items {
            item(self, it)?;
        }
        Ok(())
    }
}

// ── reader ────────────────────────────────────────────────────────────────────

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], ProtocolError> {
        if n > self.remaining() {
            return Err(ProtocolError::UnexpectedEof {
                offset: self.pos,
                needed: n,
                available: self.remaining(),
            });
        }
        let chunk = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(chunk)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], ProtocolError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, ProtocolError> {
        Ok(self.array::<1>()?[0])
    }

    fn u16(&mut self) -> Result<u16, ProtocolError> {
        Ok(u16::from_le_bytes(self.array()?))
    }

    fn u32(&mut self) -> Result<u32, ProtocolError> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    fn u64(&mut self) -> Result<u64, ProtocolError> {
        Ok(u64::from_le_bytes(self.array()?))
    }

    fn f64(&mut self) -> Result<f64, ProtocolError> {
        Ok(f64::from_le_bytes(self.array()?))
    }

    fn string(&mut self) -> Result<String, ProtocolError> {
        let start = self.pos;
        let rest = &self.data[start..];
        let nul = rest
            .iter()
            .position(|&b| b == 0)
            .ok_or(ProtocolError::UnterminatedString(start))?;
        let s = std::str::from_utf8(&rest[..nul]).map_err(|_| ProtocolError::InvalidUtf8(start))?;
        self.pos += nul + 1;
        Ok(s.to_owned())
    }

    /// Reads a count and checks that `count * min_item` bytes could exist.
    fn count(&mut self, min_item: usize) -> Result<usize, ProtocolError> {
        let offset = self.pos;
        let count = self.u32()?;
        let needed = (count as usize).saturating_mul(min_item);
        if needed > self.remaining() {
            return Err(ProtocolError::CountTooLarge {
                offset,
                count,
                remaining: self.remaining(),
            });
        }
        Ok(count as usize)
    }

    fn bytes(&mut self) -> Result<Vec<u8>, ProtocolError> {
        let len = self.count(1)?;
        Ok(self.take(len)?.to_vec())
    }

    fn vec<T>(
        &mut self,
        min_item: usize,
        mut item: impl FnMut(&mut Self) -> Result<T, ProtocolError>,
    ) -> Result<Vec<T>, ProtocolError> {
        let count = self.count(min_item)?;
        let mut out = Vec::with_capacity(count);
        for _ in 0..count {
            out.push(item(self)?);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_info() -> MusicInfo {
        MusicInfo {
            music_id: "1".into(),
            music_name: "2".into(),
            album_id: "3".into(),
            album_name: "4".into(),
            artists: vec![Artist {
                id: "5".into(),
                name: "6".into(),
            }],
            duration: 7,
        }
    }

    fn sample_line() -> LyricLine {
        LyricLine {
            start_time: 1000,
            end_time: 2000,
            words: vec![LyricWord {
                start_time: 1100,
                end_time: 1900,
                word: "Hello".into(),
            }],
            translated_lyric: "你好".into(),
            roman_lyric: "Konnichiwa".into(),
            flag: 1,
        }
    }

    #[test]
    fn test_set_music_info_wire_bytes() {
        let encoded = Message::SetMusicInfo(sample_info()).encode().unwrap();
        let expected: [u8; 26] = [
            0x02, 0x00, 0x31, 0x00, 0x32, 0x00, 0x33, 0x00, 0x34, 0x00, 0x01, 0x00, 0x00, 0x00,
            0x35, 0x00, 0x36, 0x00, 0x07, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        ];
        assert_eq!(encoded, expected);
    }

    #[test]
    fn test_every_variant_round_trips() {
        let messages = vec![
            Message::Ping,
            Message::Pong,
            Message::SetMusicInfo(sample_info()),
            Message::SetMusicAlbumCoverImageUri {
                img_url: "https://p1.music.126.net/cover.jpg".into(),
            },
            Message::SetMusicAlbumCoverImageData {
                data: vec![0xff, 0xd8, 0x00, 0x10],
            },
            Message::OnPlayProgress { progress: 123_456 },
            Message::OnVolumeChanged { volume: 0.35 },
            Message::OnPaused,
            Message::OnResumed,
            Message::OnAudioData {
                data: vec![1, 2, 3],
            },
            Message::SetLyric {
                data: vec![sample_line(), LyricLine::default()],
            },
            Message::SetLyricFromTtml {
                data: "<tt><body><p>hi</p></body></tt>".into(),
            },
            Message::Pause,
            Message::Resume,
            Message::ForwardSong,
            Message::BackwardSong,
            Message::SetVolume { volume: 1.0 },
            Message::SeekPlayProgress { progress: 42 },
        ];

        for msg in messages {
            let encoded = msg.encode().unwrap();
            assert_eq!(
                u16::from_le_bytes([encoded[0], encoded[1]]),
                msg.tag(),
                "tag prefix for {}",
                msg.name()
            );
            let decoded = Message::decode(&encoded).unwrap();
            assert_eq!(decoded, msg, "round trip for {}", msg.name());
        }
    }

    #[test]
    fn test_no_payload_messages_are_just_the_tag() {
        assert_eq!(Message::Pause.encode().unwrap(), vec![0x0c, 0x00]);
        assert_eq!(Message::BackwardSong.encode().unwrap(), vec![0x0f, 0x00]);
    }

    #[test]
    fn test_set_volume_is_le_f64() {
        let mut expected = vec![0x10, 0x00];
        expected.extend_from_slice(&0.5f64.to_le_bytes());
        assert_eq!(Message::SetVolume { volume: 0.5 }.encode().unwrap(), expected);
    }

    #[test]
    fn test_empty_vec_is_four_zero_bytes() {
        let encoded = Message::SetLyric { data: vec![] }.encode().unwrap();
        assert_eq!(encoded, vec![0x0a, 0x00, 0x00, 0x00, 0x00, 0x00]);
        assert_eq!(
            Message::decode(&encoded).unwrap(),
            Message::SetLyric { data: vec![] }
        );
    }

    #[test]
    fn test_empty_string_is_single_nul() {
        let encoded = Message::SetMusicAlbumCoverImageUri {
            img_url: String::new(),
        }
        .encode()
        .unwrap();
        assert_eq!(encoded, vec![0x03, 0x00, 0x00]);
    }

    #[test]
    fn test_unknown_tag_is_rejected() {
        assert_eq!(
            Message::decode(&[0x63, 0x00, 0x01, 0x02]),
            Err(ProtocolError::UnknownTag(99))
        );
        assert_eq!(
            Message::decode(&[0xff, 0xff]),
            Err(ProtocolError::UnknownTag(0xffff))
        );
    }

    #[test]
    fn test_short_buffers_are_rejected() {
        assert!(matches!(
            Message::decode(&[]),
            Err(ProtocolError::UnexpectedEof { .. })
        ));
        assert!(matches!(
            Message::decode(&[0x05]),
            Err(ProtocolError::UnexpectedEof { .. })
        ));
        // progress needs 8 bytes, only 3 present
        assert!(matches!(
            Message::decode(&[0x05, 0x00, 1, 2, 3]),
            Err(ProtocolError::UnexpectedEof { offset: 2, needed: 8, available: 3 })
        ));
    }

    #[test]
    fn test_oversized_counts_are_rejected_before_reading() {
        // Vec<u8> claiming 16 bytes with only 2 present
        let buf = [0x04, 0x00, 0x10, 0x00, 0x00, 0x00, 0xaa, 0xbb];
        assert!(matches!(
            Message::decode(&buf),
            Err(ProtocolError::CountTooLarge { count: 16, .. })
        ));

        // SetLyric claiming u32::MAX lines
        let buf = [0x0a, 0x00, 0xff, 0xff, 0xff, 0xff];
        assert!(matches!(
            Message::decode(&buf),
            Err(ProtocolError::CountTooLarge { .. })
        ));
    }

    #[test]
    fn test_missing_terminator_is_rejected() {
        let buf = [0x03, 0x00, b'a', b'b', b'c'];
        assert_eq!(
            Message::decode(&buf),
            Err(ProtocolError::UnterminatedString(2))
        );
    }

    #[test]
    fn test_invalid_utf8_is_rejected() {
        let buf = [0x0b, 0x00, 0xc3, 0x28, 0x00];
        assert_eq!(Message::decode(&buf), Err(ProtocolError::InvalidUtf8(2)));
    }

    #[test]
    fn test_truncated_lyric_line_is_rejected() {
        let mut encoded = Message::SetLyric {
            data: vec![sample_line()],
        }
        .encode()
        .unwrap();
        encoded.pop(); // drop the flag byte
        assert!(Message::decode(&encoded).is_err());
    }

    #[test]
    fn test_embedded_nul_fails_to_encode() {
        let msg = Message::SetLyricFromTtml {
            data: "bad\0markup".into(),
        };
        assert_eq!(msg.encode(), Err(ProtocolError::EmbeddedNul));
    }

    #[test]
    fn test_trailing_bytes_are_ignored() {
        let mut encoded = Message::OnPlayProgress { progress: 9 }.encode().unwrap();
        encoded.extend_from_slice(&[0xde, 0xad]);
        assert_eq!(
            Message::decode(&encoded).unwrap(),
            Message::OnPlayProgress { progress: 9 }
        );
    }
}
