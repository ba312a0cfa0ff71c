//! Serialize/deserialize owserver messages into/from binary.

use crate::{io_err, message::*, res};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use bytes::{buf::{Buf, BufMut}, Bytes, BytesMut};
use std::io::{Read, Result};
use std::mem;
use std::ops::Shl;
use tokio_util::codec::length_delimited::{self, LengthDelimitedCodec};

macro_rules! decode {
    ($decoder:expr) => {
        Decodable::decode(&mut $decoder)?
    };

    ($typ:ident, $buf:expr) => {
        $typ::from_bits_retain(decode!($buf))
    };
}

fn read_exact<R: Read + ?Sized>(r: &mut R, size: usize) -> Result<Vec<u8>> {
    let mut buf = vec![0; size];
    r.read_exact(&mut buf[..]).and(Ok(buf))
}

/// Header bytes that follow the leading payload length word
const FRAME_HEADER_LEN: usize = HEADER_LEN - 4;

/// Frame codec for both directions.
///
/// The leading header word is the payload length. A frame is what follows
/// it: the other 16 header bytes and the payload. [`to_frame`] builds one,
/// [`request_from_frame`] and [`response_from_frame`] take one apart.
pub fn frame_codec() -> LengthDelimitedCodec {
    length_delimited::Builder::new()
        .big_endian()
        .length_field_offset(0)
        .length_field_length(4)
        .length_adjustment(FRAME_HEADER_LEN as isize)
        .max_frame_length(MAX_PAYLOAD as usize)
        .new_codec()
}

/// A serializing specific result to overload operators on `Result`
///
/// # Overloaded operators
/// <<, ?
pub struct SResult<T>(::std::io::Result<T>);

/// A wrapper class of WriteBytesExt to provide operator overloads
/// for serializing
///
/// Operator '<<' serializes the right hand side argument into
/// the left hand side encoder
#[derive(Clone, Debug)]
pub struct Encoder<W> {
    writer: W,
    bytes: usize,
}

impl<W: WriteBytesExt> Encoder<W> {
    pub fn new(writer: W) -> Encoder<W> {
        Encoder { writer, bytes: 0 }
    }

    /// Return total bytes written
    pub fn bytes_written(&self) -> usize {
        self.bytes
    }

    /// Encode data, equivalent to: encoder << data
    pub fn encode<T: Encodable>(&mut self, data: &T) -> Result<usize> {
        let bytes = data.encode(&mut self.writer)?;
        self.bytes += bytes;
        Ok(bytes)
    }
}

impl<'a, T: Encodable, W: WriteBytesExt> Shl<&'a T> for Encoder<W> {
    type Output = SResult<Encoder<W>>;
    fn shl(mut self, rhs: &'a T) -> Self::Output {
        match self.encode(rhs) {
            Ok(_) => SResult(Ok(self)),
            Err(e) => SResult(Err(e)),
        }
    }
}

impl<'a, T: Encodable, W: WriteBytesExt> Shl<&'a T> for SResult<Encoder<W>> {
    type Output = Self;
    fn shl(self, rhs: &'a T) -> Self::Output {
        match self.0 {
            Ok(mut encoder) => match encoder.encode(rhs) {
                Ok(_) => SResult(Ok(encoder)),
                Err(e) => SResult(Err(e)),
            },
            Err(e) => SResult(Err(e)),
        }
    }
}

/// Trait representing a type which can be serialized into binary
pub trait Encodable {
    /// Encode self to w and returns the number of bytes encoded
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize>;
}

impl Encodable for u32 {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        w.write_u32::<BigEndian>(*self).and(Ok(mem::size_of::<Self>()))
    }
}

impl Encodable for i32 {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        w.write_i32::<BigEndian>(*self).and(Ok(mem::size_of::<Self>()))
    }
}

impl Encodable for SemiGlobal {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        self.bits().encode(w)
    }
}

impl Encodable for RequestHeader {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        match Encoder::new(w) << &self.payload << &self.size << &self.typ << &self.sg << &self.offset {
            SResult(Ok(enc)) => Ok(enc.bytes_written()),
            SResult(Err(e)) => Err(e),
        }
    }
}

impl Encodable for ResponseHeader {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        match Encoder::new(w) << &self.payload << &self.size << &self.ret << &self.sg << &self.offset {
            SResult(Ok(enc)) => Ok(enc.bytes_written()),
            SResult(Err(e)) => Err(e),
        }
    }
}

impl Encodable for Request {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        if self.header.payload as usize != self.payload.len() {
            return res!(io_err!(InvalidInput, "Request payload length mismatch"));
        }
        let bytes = self.header.encode(w)?;
        w.write_all(&self.payload)?;
        Ok(bytes + self.payload.len())
    }
}

impl Encodable for Response {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        if self.header.payload as usize != self.data.len() {
            return res!(io_err!(InvalidInput, "Response payload length mismatch"));
        }
        let bytes = self.header.encode(w)?;
        w.write_all(&self.data)?;
        Ok(bytes + self.data.len())
    }
}

/// Trait representing a type which can be deserialized from binary
pub trait Decodable: Sized {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self>;
}

impl Decodable for u32 {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        r.read_u32::<BigEndian>()
    }
}

impl Decodable for i32 {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        r.read_i32::<BigEndian>()
    }
}

impl Decodable for SemiGlobal {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        Ok(decode!(SemiGlobal, *r))
    }
}

impl Decodable for RequestHeader {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        Ok(RequestHeader {
            payload: decode!(*r),
            size: decode!(*r),
            typ: decode!(*r),
            sg: decode!(*r),
            offset: decode!(*r),
        })
    }
}

impl Decodable for ResponseHeader {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        Ok(ResponseHeader {
            payload: decode!(*r),
            size: decode!(*r),
            ret: decode!(*r),
            sg: decode!(*r),
            offset: decode!(*r),
        })
    }
}

impl Decodable for Request {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        let header: RequestHeader = decode!(*r);
        if header.payload > MAX_PAYLOAD {
            return res!(io_err!(InvalidData, "Request payload too large"));
        }
        let payload = read_exact(r, header.payload as usize)?;
        Ok(Request { header, payload })
    }
}

impl Decodable for Response {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        let header: ResponseHeader = decode!(*r);
        if header.payload > MAX_PAYLOAD {
            return res!(io_err!(InvalidData, "Response payload too large"));
        }
        let data = read_exact(r, header.payload as usize)?;
        Ok(Response { header, data })
    }
}

/// Helper function to read a request from a byte-oriented stream
pub fn read_request<R: ReadBytesExt>(r: &mut R) -> Result<Request> {
    Decodable::decode(r)
}

/// Helper function to read a response from a byte-oriented stream
pub fn read_response<R: ReadBytesExt>(r: &mut R) -> Result<Response> {
    Decodable::decode(r)
}

/// Helper function to write a response into a byte-oriented stream
pub fn write_response<W: WriteBytesExt>(w: &mut W, msg: &Response) -> Result<usize> {
    msg.encode(w)
}

/// Helper function to write a request into a byte-oriented stream
pub fn write_request<W: WriteBytesExt>(w: &mut W, msg: &Request) -> Result<usize> {
    msg.encode(w)
}

/// Serialize a message into a frame for [`frame_codec`].
///
/// The codec writes the leading payload length itself, so the frame is
/// everything after the first header word.
pub fn to_frame<T: Encodable>(msg: &T) -> Result<Bytes> {
    let mut writer = BytesMut::with_capacity(HEADER_LEN + 256).writer();
    msg.encode(&mut writer)?;
    let mut frozen = writer.into_inner().freeze();
    Ok(frozen.split_off(4))
}

/// Put the payload length word the codec consumed back in front of `frame`.
fn unframed(frame: Bytes) -> Result<impl Read> {
    let payload = frame
        .len()
        .checked_sub(FRAME_HEADER_LEN)
        .ok_or_else(|| io_err!(UnexpectedEof, "Frame shorter than a header"))?;
    let word = Bytes::copy_from_slice(&(payload as u32).to_be_bytes());
    Ok(word.chain(frame).reader())
}

/// Decode a request from a frame produced by [`frame_codec`].
pub fn request_from_frame(frame: Bytes) -> Result<Request> {
    read_request(&mut unframed(frame)?)
}

/// Decode a response from a frame produced by [`frame_codec`].
pub fn response_from_frame(frame: Bytes) -> Result<Response> {
    read_response(&mut unframed(frame)?)
}

#[test]
fn header_is_network_order() {
    let header = RequestHeader {
        payload: 0x0000_0010,
        size: 0x0000_2000,
        typ: MsgType::Read as u32,
        sg: SemiGlobal::BUSRET,
        offset: 0x0102_0304,
    };
    let mut buf = Vec::new();
    assert_eq!(header.encode(&mut buf).unwrap(), HEADER_LEN);
    assert_eq!(
        buf,
        vec![0, 0, 0, 0x10, 0, 0, 0x20, 0, 0, 0, 0, 1, 0, 0, 0, 2, 1, 2, 3, 4]
    );
}

#[test]
fn request_encode_decode() {
    use std::io::Cursor;

    let sg = SemiGlobal::PERSISTENT.with_device_format(DeviceFormat::Fic);
    let expected = Request::new(MsgType::Write, "/09.0102030405AB/memory", &[1, 2, 3], 3, 7, sg);
    let mut buf = Vec::new();
    let n = expected.encode(&mut buf).unwrap();
    assert_eq!(n, buf.len());

    let actual = read_request(&mut Cursor::new(buf)).unwrap();
    assert_eq!(expected, actual);
    assert_eq!(actual.header.sg.bits(), sg.bits());
}

#[test]
fn negative_ret_survives() {
    use std::io::Cursor;

    let response = Response::ret(-2, SemiGlobal::empty());
    let mut buf = Vec::new();
    write_response(&mut buf, &response).unwrap();
    assert_eq!(&buf[8..12], &[0xFF, 0xFF, 0xFF, 0xFE]);
    assert_eq!(read_response(&mut Cursor::new(buf)).unwrap().header.ret, -2);
}

#[test]
fn short_payload_is_an_error() {
    use std::io::Cursor;

    let mut buf = Vec::new();
    Request::new(MsgType::Read, "/", &[], 10, 0, SemiGlobal::empty())
        .encode(&mut buf)
        .unwrap();
    buf.pop();
    let err = read_request(&mut Cursor::new(buf)).unwrap_err();
    assert_eq!(err.kind(), std::io::ErrorKind::UnexpectedEof);
}

#[test]
fn frame_drops_the_length_word() {
    let response = Response::with_data(b"40.0".to_vec(), SemiGlobal::empty(), 0);
    let frame = to_frame(&response).unwrap();
    assert_eq!(frame.len(), HEADER_LEN - 4 + 4);
    assert_eq!(&frame[..4], &[0, 0, 0, 4]);
    assert_eq!(&frame[16..], b"40.0");
}

#[cfg(test)]
async fn through_codec(msg: &impl Encodable) -> (Vec<u8>, Bytes) {
    use futures::sink::SinkExt;
    use tokio_stream::StreamExt;
    use tokio_util::codec::{FramedRead, FramedWrite};

    let mut wire = Vec::new();
    FramedWrite::new(&mut wire, frame_codec())
        .send(to_frame(msg).unwrap())
        .await
        .unwrap();
    let mut framed = FramedRead::new(&wire[..], frame_codec());
    let frame = framed.next().await.unwrap().unwrap().freeze();
    assert!(framed.next().await.is_none());
    (wire, frame)
}

#[tokio::test]
async fn request_survives_the_codec() {
    let sg = SemiGlobal::BUSRET.with_temperature_scale(TemperatureScale::Kelvin);
    let request = Request::new(MsgType::Write, "/21.AABBCCDD0000/mission/delay", b"15", 2, 0, sg);
    let (wire, frame) = through_codec(&request).await;
    assert_eq!(wire.len(), HEADER_LEN + request.payload.len());
    assert_eq!(frame.len(), wire.len() - 4);
    assert_eq!(request_from_frame(frame).unwrap(), request);
}

#[tokio::test]
async fn response_survives_the_codec() {
    let response = Response::with_data(b"40.00".to_vec(), SemiGlobal::PERSISTENT, 3);
    let (wire, frame) = through_codec(&response).await;
    assert_eq!(&wire[..4], &[0, 0, 0, 5]);
    assert_eq!(response_from_frame(frame).unwrap(), response);

    let terminator = Response::ret(0, SemiGlobal::empty());
    let (_, frame) = through_codec(&terminator).await;
    assert!(response_from_frame(frame).unwrap().is_terminator());
}

#[tokio::test]
async fn codec_refuses_oversized_length() {
    use tokio_stream::StreamExt;
    use tokio_util::codec::FramedRead;

    let header = RequestHeader {
        payload: MAX_PAYLOAD + 1,
        ..Default::default()
    };
    let mut wire = Vec::new();
    header.encode(&mut wire).unwrap();
    let err = FramedRead::new(&wire[..], frame_codec()).next().await.unwrap().unwrap_err();
    assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
}

#[test]
fn oversized_payload_rejected_before_allocation() {
    use std::io::Cursor;

    let header = ResponseHeader {
        payload: MAX_PAYLOAD + 1,
        ..Default::default()
    };
    let mut buf = Vec::new();
    header.encode(&mut buf).unwrap();
    let err = read_response(&mut Cursor::new(buf)).unwrap_err();
    assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
}
